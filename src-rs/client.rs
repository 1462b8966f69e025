use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::multipart::Form;
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ServiceError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelInfo {
    #[serde(rename = "type", default)]
    pub model_type: String,
    /// Default inference parameters advertised by the server.
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Model catalog as returned by `/info/`. `raw` keeps the full payload.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub models: BTreeMap<String, ModelInfo>,
    pub raw: Value,
}

impl Catalog {
    pub fn from_value(raw: Value) -> Result<Self, ServiceError> {
        let models = match raw.get("models") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(models) => serde_json::from_value(models.clone())
                .map_err(|e| ServiceError::Decode(format!("invalid models in catalog: {e}")))?,
        };
        Ok(Self { models, raw })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageInfo {
    pub image: String,
}

/// One `/infer/{model}` call. `upload` is sent as the request's image file.
#[derive(Debug, Clone, PartialEq)]
pub struct InferCall {
    pub image: String,
    pub output: String,
    pub params: Value,
    pub upload: Option<PathBuf>,
}

/// Raw inference payload, passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceResult {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Remote label/inference service. All calls block until the server answers.
pub trait LabelService {
    fn catalog(&self) -> Result<Catalog, ServiceError>;

    fn register_image(
        &self,
        name: &str,
        file: &Path,
        params: &Value,
    ) -> Result<ImageInfo, ServiceError>;

    fn attach_label(
        &self,
        image: &str,
        label: &Path,
        tag: Option<&str>,
        params: &Value,
    ) -> Result<(), ServiceError>;

    fn infer(&self, model: &str, call: &InferCall) -> Result<InferenceResult, ServiceError>;
}

/// MONAI Label REST client.
pub struct HttpLabelService {
    base: Url,
    http: HttpClient,
}

impl HttpLabelService {
    pub fn new(server: &str, timeout: Duration) -> Result<Self, ServiceError> {
        let base = Url::parse(server.trim())
            .map_err(|e| ServiceError::Url(format!("{server}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ServiceError::Url(server.to_string()));
        }
        let http = HttpClient::builder().timeout(timeout).build()?;
        Ok(Self { base, http })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ServiceError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ServiceError::Url(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

impl LabelService for HttpLabelService {
    fn catalog(&self) -> Result<Catalog, ServiceError> {
        let url = self.endpoint(&["info", ""])?;
        debug!(%url, "fetching catalog");
        let response = checked(self.http.get(url).send()?)?;
        let raw: Value = response
            .json()
            .map_err(|e| ServiceError::Decode(format!("catalog is not JSON: {e}")))?;
        Catalog::from_value(raw)
    }

    fn register_image(
        &self,
        name: &str,
        file: &Path,
        params: &Value,
    ) -> Result<ImageInfo, ServiceError> {
        let url = self.endpoint(&["datastore", ""])?;
        debug!(%url, name, file = %file.display(), "registering image");
        let form = Form::new()
            .text("params", params.to_string())
            .file("file", file)?;
        let response = checked(
            self.http
                .put(url)
                .query(&[("image", name)])
                .multipart(form)
                .send()?,
        )?;
        response
            .json::<ImageInfo>()
            .map_err(|e| ServiceError::Decode(format!("save-image response: {e}")))
    }

    fn attach_label(
        &self,
        image: &str,
        label: &Path,
        tag: Option<&str>,
        params: &Value,
    ) -> Result<(), ServiceError> {
        let url = self.endpoint(&["datastore", "label"])?;
        debug!(%url, image, label = %label.display(), "attaching label");
        let mut query = vec![("image", image)];
        if let Some(tag) = tag {
            query.push(("tag", tag));
        }
        let form = Form::new()
            .text("params", params.to_string())
            .file("label", label)?;
        checked(self.http.put(url).query(&query).multipart(form).send()?)?;
        Ok(())
    }

    fn infer(&self, model: &str, call: &InferCall) -> Result<InferenceResult, ServiceError> {
        let url = self.endpoint(&["infer", model])?;
        debug!(%url, image = %call.image, output = %call.output, "running inference");
        let mut form = Form::new().text("params", call.params.to_string());
        if let Some(upload) = &call.upload {
            form = form.file("file", upload)?;
        }
        let response = checked(
            self.http
                .post(url)
                .query(&[("image", call.image.as_str()), ("output", call.output.as_str())])
                .multipart(form)
                .send()?,
        )?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = response.bytes()?.to_vec();
        Ok(InferenceResult { content_type, body })
    }
}

fn checked(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(ServiceError::Status {
        status: status.as_u16(),
        body: truncate_text(body.trim(), 2400),
    })
}

fn truncate_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect::<String>() + "\n...<truncated>..."
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn service(server: &mockito::Server) -> HttpLabelService {
        HttpLabelService::new(&server.url(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn fetches_and_decodes_catalog() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/info/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"name": "pathology", "models": {
                    "segmentation_nuclei": {"type": "segmentation", "config": {"min_poly_area": 30}},
                    "classification_nuclei": {"type": "classification"}
                }}"#,
            )
            .create();

        let catalog = service(&server).catalog().unwrap();
        mock.assert();
        assert_eq!(catalog.models.len(), 2);
        assert_eq!(catalog.models["segmentation_nuclei"].model_type, "segmentation");
        assert_eq!(
            catalog.models["segmentation_nuclei"].config.get("min_poly_area"),
            Some(&json!(30))
        );
        assert_eq!(catalog.raw["name"], json!("pathology"));
    }

    #[test]
    fn catalog_without_models_is_empty() {
        let catalog = Catalog::from_value(json!({"name": "empty"})).unwrap();
        assert!(catalog.models.is_empty());
        assert!(Catalog::from_value(json!({"models": [1, 2]})).is_err());
    }

    #[test]
    fn server_errors_carry_status_and_body() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", "/info/")
            .with_status(503)
            .with_body("warming up")
            .create();

        match service(&server).catalog() {
            Err(ServiceError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "warming up");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[test]
    fn registers_image_and_attaches_label() {
        let dir = tempdir().unwrap();
        let patch = dir.path().join("patch.png");
        let label = dir.path().join("label.xml");
        fs::write(&patch, b"png").unwrap();
        fs::write(&label, "<ASAP_Annotations/>").unwrap();

        let mut server = mockito::Server::new();
        let save_image = server
            .mock("PUT", Matcher::Regex("^/datastore/".to_string()))
            .match_query(Matcher::UrlEncoded(
                "image".to_string(),
                "slide-patch-1_2_3_4".to_string(),
            ))
            .match_body(Matcher::Regex("name=\"file\"".to_string()))
            .with_status(200)
            .with_body(r#"{"image": "slide-patch-1_2_3_4"}"#)
            .create();
        let save_label = server
            .mock("PUT", Matcher::Regex("^/datastore/label".to_string()))
            .match_query(Matcher::UrlEncoded(
                "image".to_string(),
                "slide-patch-1_2_3_4".to_string(),
            ))
            .match_body(Matcher::Regex("name=\"label\"".to_string()))
            .with_status(200)
            .with_body("{}")
            .create();

        let client = service(&server);
        let info = client
            .register_image("slide-patch-1_2_3_4", &patch, &json!({}))
            .unwrap();
        assert_eq!(info.image, "slide-patch-1_2_3_4");
        client
            .attach_label(&info.image, &label, None, &json!({}))
            .unwrap();

        save_image.assert();
        save_label.assert();
    }

    #[test]
    fn missing_upload_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let server = mockito::Server::new();
        let err = service(&server)
            .register_image("x", &dir.path().join("gone.png"), &json!({}))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Io(_)));
    }

    #[test]
    fn inference_returns_payload_unchanged() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", Matcher::Regex("^/infer/segmentation_nuclei".to_string()))
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("image".to_string(), "slide".to_string()),
                Matcher::UrlEncoded("output".to_string(), "asap".to_string()),
            ]))
            .match_body(Matcher::Regex("tile_size".to_string()))
            .with_status(200)
            .with_header("content-type", "application/xml")
            .with_body("<ASAP_Annotations><Annotations/></ASAP_Annotations>")
            .create();

        let call = InferCall {
            image: "slide".to_string(),
            output: "asap".to_string(),
            params: json!({"tile_size": [1024, 1024]}),
            upload: None,
        };
        let result = service(&server).infer("segmentation_nuclei", &call).unwrap();
        mock.assert();
        assert_eq!(result.content_type.as_deref(), Some("application/xml"));
        assert_eq!(
            result.body,
            b"<ASAP_Annotations><Annotations/></ASAP_Annotations>".to_vec()
        );
    }

    #[test]
    fn rejects_unusable_server_urls() {
        assert!(HttpLabelService::new("not a url", Duration::from_secs(1)).is_err());
        assert!(HttpLabelService::new("mailto:someone@example.com", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn endpoints_keep_base_path() {
        let client =
            HttpLabelService::new("http://127.0.0.1:8000/monai/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.endpoint(&["info", ""]).unwrap().as_str(),
            "http://127.0.0.1:8000/monai/info/"
        );
        assert_eq!(
            client.endpoint(&["infer", "u-net++"]).unwrap().path(),
            "/monai/infer/u-net++"
        );
    }
}

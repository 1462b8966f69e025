use std::path::PathBuf;

use serde_json::{json, Map, Value};
use tracing::info;

use crate::client::{Catalog, InferCall, InferenceResult, LabelService};
use crate::error::StageError;
use crate::region::Region;

pub const OUTPUT_FORMAT: &str = "asap";
const MIN_POLY_AREA: u32 = 30;

/// Image the server should run on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// Already in the server's datastore (a slide or a registered patch).
    Stored(String),
    /// Sent along with the request.
    Upload { name: String, file: PathBuf },
}

impl ImageRef {
    pub fn id(&self) -> &str {
        match self {
            ImageRef::Stored(id) => id,
            ImageRef::Upload { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRequest {
    pub model: String,
    pub region: Region,
    pub tile_size: u32,
    pub image: ImageRef,
    pub whole_slide: bool,
}

impl InferenceRequest {
    /// `None` for a blank model name or a zero tile size.
    pub fn new(
        model: &str,
        region: Region,
        tile_size: u32,
        image: ImageRef,
        whole_slide: bool,
    ) -> Option<Self> {
        if model.trim().is_empty() || tile_size == 0 {
            return None;
        }
        Some(Self {
            model: model.to_string(),
            region,
            tile_size,
            image,
            whole_slide,
        })
    }

    /// Request parameters: the model's advertised scalar defaults, overridden
    /// by the region (and, for slides, the tile layout).
    pub fn params(&self, catalog: &Catalog) -> Value {
        let mut params = Map::new();
        if let Some(model) = catalog.models.get(&self.model) {
            for (key, value) in &model.config {
                if !value.is_array() && !value.is_object() {
                    params.insert(key.clone(), value.clone());
                }
            }
        }

        let r = self.region;
        params.insert("location".to_string(), json!([r.x, r.y]));
        params.insert("size".to_string(), json!([r.width, r.height]));
        params.insert("result_extension".to_string(), json!(".xml"));
        params.insert("result_dtype".to_string(), json!("uint8"));
        params.insert("result_compress".to_string(), json!(false));
        if self.whole_slide {
            params.insert(
                "tile_size".to_string(),
                json!([self.tile_size, self.tile_size]),
            );
            params
                .entry("min_poly_area".to_string())
                .or_insert(json!(MIN_POLY_AREA));
        }
        Value::Object(params)
    }

    pub fn call(&self, catalog: &Catalog) -> InferCall {
        let upload = match &self.image {
            ImageRef::Stored(_) => None,
            ImageRef::Upload { file, .. } => Some(file.clone()),
        };
        InferCall {
            image: self.image.id().to_string(),
            output: OUTPUT_FORMAT.to_string(),
            params: self.params(catalog),
            upload,
        }
    }
}

/// Run the request and hand back whatever the server produced.
pub fn dispatch(
    service: &dyn LabelService,
    catalog: &Catalog,
    request: &InferenceRequest,
) -> Result<InferenceResult, StageError> {
    let call = request.call(catalog);
    info!(
        model = %request.model,
        image = %call.image,
        region = %request.region,
        tile_size = request.tile_size,
        whole_slide = request.whole_slide,
        "running inference"
    );
    let result = service
        .infer(&request.model, &call)
        .map_err(|source| StageError::Inference {
            model: request.model.clone(),
            source,
        })?;
    info!(bytes = result.body.len(), "inference finished");
    Ok(result)
}

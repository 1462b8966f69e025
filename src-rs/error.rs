use std::io;

use thiserror::Error;

/// Failure talking to the label server.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("invalid server URL: {0}")]
    Url(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("region {region} lies outside the {width}x{height} source image")]
    OutsideImage {
        region: String,
        width: u32,
        height: u32,
    },
}

/// A pipeline step that failed. Each variant names the step.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("failed to fetch model catalog")]
    Catalog(#[source] ServiceError),

    #[error("model selection failed")]
    Chooser(#[source] io::Error),

    #[error("failed to write annotation document")]
    AnnotationWrite(#[source] io::Error),

    #[error("failed to materialize patch image")]
    Patch(#[source] PatchError),

    #[error("failed to register patch image {name}")]
    RegisterImage {
        name: String,
        #[source]
        source: ServiceError,
    },

    #[error("failed to attach label to image {image}")]
    AttachLabel {
        image: String,
        #[source]
        source: ServiceError,
    },

    #[error("inference with model {model} failed")]
    Inference {
        model: String,
        #[source]
        source: ServiceError,
    },
}

impl StageError {
    /// Short step name for logs and JSON summaries.
    pub fn step(&self) -> &'static str {
        match self {
            StageError::Catalog(_) => "catalog",
            StageError::Chooser(_) => "select_model",
            StageError::AnnotationWrite(_) => "write_annotations",
            StageError::Patch(_) => "write_patch",
            StageError::RegisterImage { .. } => "save_image",
            StageError::AttachLabel { .. } => "save_label",
            StageError::Inference { .. } => "infer",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn stage_errors_name_their_step_and_keep_the_cause() {
        let err = StageError::AttachLabel {
            image: "slide-patch-1_2_3_4".to_string(),
            source: ServiceError::Status {
                status: 500,
                body: "boom".to_string(),
            },
        };
        assert_eq!(err.step(), "save_label");
        assert!(err.to_string().contains("slide-patch-1_2_3_4"));
        let cause = err.source().unwrap().to_string();
        assert!(cause.contains("500"));
        assert!(cause.contains("boom"));
    }

    #[test]
    fn io_errors_convert() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        match ServiceError::from(io_err) {
            ServiceError::Io(_) => {}
            other => panic!("expected Io error, got {other:?}"),
        }
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        match PatchError::from(io_err) {
            PatchError::Io(_) => {}
            other => panic!("expected Io error, got {other:?}"),
        }
    }
}

use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tracing::{info, info_span};

use crate::annotations::write_annotations_xml;
use crate::catalog::{resolve_model, ModelChooser};
use crate::client::{InferenceResult, LabelService};
use crate::config;
use crate::dispatch::{dispatch, ImageRef, InferenceRequest};
use crate::error::StageError;
use crate::geometry::Shape;
use crate::hierarchy::LabeledObject;
use crate::region::{resolve_region, Region};
use crate::stager::{stage_patch, PatchSource};

/// One segmentation request, as triggered by a finished rectangle selection.
#[derive(Debug, Clone)]
pub struct SegmentJob<'a> {
    pub source: &'a Path,
    pub selection: Option<&'a Shape>,
    pub objects: &'a [LabeledObject],
    pub whole_slide: bool,
    /// Base name for every artifact of this run.
    pub export_name: String,
    pub tile_size: u32,
    pub tmp_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoRegion,
    NoSegmentationModel,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::NoRegion => "no rectangular region selected",
            SkipReason::NoSegmentationModel => "no segmentation model selected",
        }
    }
}

#[derive(Debug)]
pub struct Completion {
    pub model: String,
    pub region: Region,
    pub tile_size: u32,
    pub image: String,
    /// Registered patch name, when a patch and its label were staged.
    pub staged: Option<String>,
    pub annotations: usize,
    pub result: InferenceResult,
    /// Files handed to the server; removed on drop unless kept.
    pub temp_files: Vec<TempPath>,
}

impl Completion {
    pub fn keep_temp_files(&mut self) -> std::io::Result<Vec<PathBuf>> {
        self.temp_files.drain(..).map(|p| p.keep().map_err(|e| e.error)).collect()
    }
}

#[derive(Debug)]
pub enum Outcome {
    Skipped(SkipReason),
    Completed(Completion),
}

/// Run one region through catalog lookup, optional staging and inference.
/// Empty states come back as `Outcome::Skipped`; only real failures are
/// errors.
pub fn run_segmentation(
    service: &dyn LabelService,
    patches: &dyn PatchSource,
    chooser: &mut dyn ModelChooser,
    job: &SegmentJob<'_>,
) -> Result<Outcome, StageError> {
    let span = info_span!(
        "segment",
        image = %config::file_name(job.source),
        export = %job.export_name
    );
    let _enter = span.enter();

    let Some(region) = resolve_region(job.selection) else {
        info!("{}", SkipReason::NoRegion.as_str());
        return Ok(Outcome::Skipped(SkipReason::NoRegion));
    };
    info!(whole_slide = job.whole_slide, %region, "new region");

    let catalog = service.catalog().map_err(StageError::Catalog)?;
    let Some(selection) = resolve_model(&catalog, chooser, job.whole_slide, job.tile_size)
        .map_err(StageError::Chooser)?
    else {
        info!("{}", SkipReason::NoSegmentationModel.as_str());
        return Ok(Outcome::Skipped(SkipReason::NoSegmentationModel));
    };
    info!(model = %selection.name, tile_size = selection.tile_size, "model resolved");

    let mut temp_files = Vec::new();
    let mut staged = None;
    let mut annotations = 0;

    let image = if job.whole_slide {
        let mut image = ImageRef::Stored(config::image_id(job.source));
        let written = write_annotations_xml(job.objects, region, &job.tmp_dir, &job.export_name)
            .map_err(StageError::AnnotationWrite)?;
        if let Some((doc, label)) = written {
            annotations = doc.annotations.len();
            let patch = stage_patch(
                service,
                patches,
                &config::image_id(job.source),
                region,
                &label,
                &job.tmp_dir,
                &job.export_name,
            )?;
            image = ImageRef::Stored(patch.image);
            staged = Some(patch.name);
            temp_files.push(label);
            temp_files.push(patch.patch_file);
        }
        image
    } else {
        ImageRef::Upload {
            name: job.export_name.clone(),
            file: job.source.to_path_buf(),
        }
    };

    let Some(request) = InferenceRequest::new(
        &selection.name,
        region,
        selection.tile_size,
        image,
        job.whole_slide,
    ) else {
        return Ok(Outcome::Skipped(SkipReason::NoSegmentationModel));
    };
    let result = dispatch(service, &catalog, &request)?;

    Ok(Outcome::Completed(Completion {
        model: request.model,
        region,
        tile_size: request.tile_size,
        image: request.image.id().to_string(),
        staged,
        annotations,
        result,
        temp_files,
    }))
}

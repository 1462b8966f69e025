use std::fs::File;
use std::path::{Path, PathBuf};

use image::{GenericImageView, ImageFormat};
use serde_json::json;
use tempfile::{Builder, TempPath};
use tracing::info;

use crate::client::LabelService;
use crate::error::{PatchError, StageError};
use crate::region::Region;

/// Produces the pixels for a patch. Decoding slides is someone else's job;
/// implementations only need to put an image for `region` at `dest`.
pub trait PatchSource {
    fn write_patch(&self, region: Region, dest: &Path) -> Result<(), PatchError>;
}

/// Crops the patch out of a raster the `image` crate can decode.
#[derive(Debug, Clone)]
pub struct ImagePatchSource {
    path: PathBuf,
}

impl ImagePatchSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PatchSource for ImagePatchSource {
    fn write_patch(&self, region: Region, dest: &Path) -> Result<(), PatchError> {
        let img = image::open(&self.path)?;
        let (img_w, img_h) = img.dimensions();

        let x0 = i64::from(region.x).clamp(0, i64::from(img_w));
        let y0 = i64::from(region.y).clamp(0, i64::from(img_h));
        let x1 = (i64::from(region.x) + i64::from(region.width)).clamp(0, i64::from(img_w));
        let y1 = (i64::from(region.y) + i64::from(region.height)).clamp(0, i64::from(img_h));
        if x1 <= x0 || y1 <= y0 {
            return Err(PatchError::OutsideImage {
                region: region.to_string(),
                width: img_w,
                height: img_h,
            });
        }

        let patch = img.crop_imm(x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32);
        patch.save_with_format(dest, ImageFormat::Png)?;
        Ok(())
    }
}

/// Leaves the patch file empty; the server reads the slide on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderPatchSource;

impl PatchSource for PlaceholderPatchSource {
    fn write_patch(&self, _region: Region, dest: &Path) -> Result<(), PatchError> {
        File::create(dest)?;
        Ok(())
    }
}

/// Server-side image plus the temp files that were handed to the server.
#[derive(Debug)]
pub struct StagedPatch {
    pub image: String,
    pub name: String,
    pub patch_file: TempPath,
}

pub fn patch_name(image_id: &str, region: Region) -> String {
    format!("{image_id}-patch-{}", region.patch_suffix())
}

/// Materialize the patch, register it, then attach `label` to it. The first
/// failing step aborts; nothing already sent is undone.
pub fn stage_patch(
    service: &dyn LabelService,
    source: &dyn PatchSource,
    image_id: &str,
    region: Region,
    label: &Path,
    tmp_dir: &Path,
    base: &str,
) -> Result<StagedPatch, StageError> {
    let patch_file = Builder::new()
        .prefix(&format!("{base}-patch"))
        .suffix(".png")
        .tempfile_in(tmp_dir)
        .map_err(|e| StageError::Patch(e.into()))?
        .into_temp_path();
    source
        .write_patch(region, &patch_file)
        .map_err(StageError::Patch)?;

    let name = patch_name(image_id, region);
    let info = service
        .register_image(&name, &patch_file, &json!({}))
        .map_err(|source| StageError::RegisterImage {
            name: name.clone(),
            source,
        })?;
    info!(image = %info.image, %name, "registered patch image");

    service
        .attach_label(&info.image, label, None, &json!({}))
        .map_err(|source| StageError::AttachLabel {
            image: info.image.clone(),
            source,
        })?;
    info!(image = %info.image, label = %label.display(), "attached label");

    Ok(StagedPatch {
        image: info.image,
        name,
        patch_file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Catalog, ImageInfo, InferCall, InferenceResult};
    use crate::error::ServiceError;
    use image::{Rgb, RgbImage};
    use serde_json::Value;
    use std::cell::RefCell;
    use std::fs;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeService {
        calls: RefCell<Vec<String>>,
        fail_register: bool,
        fail_label: bool,
    }

    impl LabelService for FakeService {
        fn catalog(&self) -> Result<Catalog, ServiceError> {
            unreachable!("stager never reads the catalog")
        }

        fn register_image(
            &self,
            name: &str,
            file: &Path,
            _params: &Value,
        ) -> Result<ImageInfo, ServiceError> {
            assert!(file.exists());
            self.calls.borrow_mut().push(format!("save_image:{name}"));
            if self.fail_register {
                return Err(ServiceError::Status {
                    status: 500,
                    body: "disk full".to_string(),
                });
            }
            Ok(ImageInfo {
                image: format!("{name}-id"),
            })
        }

        fn attach_label(
            &self,
            image: &str,
            _label: &Path,
            tag: Option<&str>,
            _params: &Value,
        ) -> Result<(), ServiceError> {
            assert_eq!(tag, None);
            self.calls.borrow_mut().push(format!("save_label:{image}"));
            if self.fail_label {
                return Err(ServiceError::Decode("bad label".to_string()));
            }
            Ok(())
        }

        fn infer(&self, _model: &str, _call: &InferCall) -> Result<InferenceResult, ServiceError> {
            unreachable!("stager never runs inference")
        }
    }

    struct FailingSource;

    impl PatchSource for FailingSource {
        fn write_patch(&self, _region: Region, _dest: &Path) -> Result<(), PatchError> {
            Err(PatchError::OutsideImage {
                region: "0,0,1,1".to_string(),
                width: 0,
                height: 0,
            })
        }
    }

    fn label_file(dir: &Path) -> PathBuf {
        let label = dir.join("label.xml");
        fs::write(&label, "<ASAP_Annotations/>").unwrap();
        label
    }

    #[test]
    fn patch_names_encode_the_region() {
        assert_eq!(
            patch_name("slide-01", Region::new(100, 200, 50, 60)),
            "slide-01-patch-100_200_50_60"
        );
    }

    #[test]
    fn registers_then_attaches_in_order() {
        let dir = tempdir().unwrap();
        let label = label_file(dir.path());
        let service = FakeService::default();
        let region = Region::new(1, 2, 3, 4);

        let staged = stage_patch(
            &service,
            &PlaceholderPatchSource,
            "slide",
            region,
            &label,
            dir.path(),
            "abc",
        )
        .unwrap();

        assert_eq!(staged.name, "slide-patch-1_2_3_4");
        assert_eq!(staged.image, "slide-patch-1_2_3_4-id");
        assert_eq!(
            *service.calls.borrow(),
            vec![
                "save_image:slide-patch-1_2_3_4".to_string(),
                "save_label:slide-patch-1_2_3_4-id".to_string()
            ]
        );
        let file_name = staged.patch_file.file_name().unwrap().to_str().unwrap().to_string();
        assert!(file_name.starts_with("abc-patch"));
        assert!(file_name.ends_with(".png"));
    }

    #[test]
    fn register_failure_stops_before_label() {
        let dir = tempdir().unwrap();
        let label = label_file(dir.path());
        let service = FakeService {
            fail_register: true,
            ..Default::default()
        };
        let err = stage_patch(
            &service,
            &PlaceholderPatchSource,
            "slide",
            Region::new(0, 0, 8, 8),
            &label,
            dir.path(),
            "abc",
        )
        .unwrap_err();
        assert_eq!(err.step(), "save_image");
        assert_eq!(service.calls.borrow().len(), 1);
    }

    #[test]
    fn label_failure_names_the_registered_image() {
        let dir = tempdir().unwrap();
        let label = label_file(dir.path());
        let service = FakeService {
            fail_label: true,
            ..Default::default()
        };
        let err = stage_patch(
            &service,
            &PlaceholderPatchSource,
            "slide",
            Region::new(0, 0, 8, 8),
            &label,
            dir.path(),
            "abc",
        )
        .unwrap_err();
        assert_eq!(err.step(), "save_label");
        assert!(err.to_string().contains("slide-patch-0_0_8_8-id"));
    }

    #[test]
    fn patch_failure_makes_no_remote_calls() {
        let dir = tempdir().unwrap();
        let label = label_file(dir.path());
        let service = FakeService::default();
        let err = stage_patch(
            &service,
            &FailingSource,
            "slide",
            Region::new(0, 0, 8, 8),
            &label,
            dir.path(),
            "abc",
        )
        .unwrap_err();
        assert_eq!(err.step(), "write_patch");
        assert!(service.calls.borrow().is_empty());
    }

    #[test]
    fn crops_and_clamps_to_image_bounds() {
        let dir = tempdir().unwrap();
        let source_path = dir.path().join("source.png");
        let mut img = RgbImage::new(40, 30);
        img.put_pixel(35, 25, Rgb([255, 0, 0]));
        img.save(&source_path).unwrap();

        let dest = dir.path().join("patch.png");
        ImagePatchSource::new(&source_path)
            .write_patch(Region::new(30, 20, 50, 50), &dest)
            .unwrap();

        let patch = image::open(&dest).unwrap().to_rgb8();
        assert_eq!(patch.dimensions(), (10, 10));
        assert_eq!(*patch.get_pixel(5, 5), Rgb([255, 0, 0]));
    }

    #[test]
    fn region_outside_image_is_rejected() {
        let dir = tempdir().unwrap();
        let source_path = dir.path().join("source.png");
        RgbImage::new(10, 10).save(&source_path).unwrap();

        let err = ImagePatchSource::new(&source_path)
            .write_patch(Region::new(20, 20, 5, 5), &dir.path().join("patch.png"))
            .unwrap_err();
        assert!(matches!(err, PatchError::OutsideImage { width: 10, height: 10, .. }));
    }
}

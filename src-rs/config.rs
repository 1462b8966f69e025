use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8000";
pub const DEFAULT_TILE_SIZE: u32 = 1024;
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
const EXPORT_NAME_LEN: usize = 10;

/// Extensions handled as plain single-frame images; anything else is a slide.
const SIMPLE_IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn server_url(flag: Option<&str>) -> String {
    flag.map(str::to_string)
        .filter(|v| !v.trim().is_empty())
        .or_else(|| env_value("PATCH_INFER_SERVER"))
        .unwrap_or_else(|| DEFAULT_SERVER.to_string())
}

pub fn tmp_dir(flag: Option<&Path>) -> PathBuf {
    flag.map(Path::to_path_buf)
        .or_else(|| env_value("PATCH_INFER_TMP_DIR").map(PathBuf::from))
        .unwrap_or_else(env::temp_dir)
}

pub fn timeout(flag: Option<u64>) -> Duration {
    let secs = flag
        .or_else(|| env_value("PATCH_INFER_TIMEOUT_SECS").and_then(|v| v.trim().parse().ok()))
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    Duration::from_secs(secs.max(1))
}

pub fn is_whole_slide(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    !SIMPLE_IMAGE_EXTENSIONS.contains(&ext.as_str())
}

/// File name of the source image, as the server knows it.
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("image")
        .to_string()
}

/// Datastore id of a slide: its file name without the extension.
pub fn image_id(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image")
        .to_string()
}

/// Random lowercase identifier used to name one export's artifacts.
pub fn generate_name() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(EXPORT_NAME_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slide_detection_by_extension() {
        assert!(!is_whole_slide(Path::new("/data/he.png")));
        assert!(!is_whole_slide(Path::new("/data/HE.JPG")));
        assert!(!is_whole_slide(Path::new("he.jpeg")));
        assert!(is_whole_slide(Path::new("/slides/TCGA-01.svs")));
        assert!(is_whole_slide(Path::new("/slides/case.ome.tiff")));
        assert!(is_whole_slide(Path::new("/slides/no-extension")));
    }

    #[test]
    fn names_and_ids() {
        let path = Path::new("/slides/TCGA-01.svs");
        assert_eq!(file_name(path), "TCGA-01.svs");
        assert_eq!(image_id(path), "TCGA-01");
    }

    #[test]
    fn generated_names_are_lowercase_alphanumeric() {
        let name = generate_name();
        assert_eq!(name.len(), EXPORT_NAME_LEN);
        assert!(name
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(generate_name(), generate_name());
    }

    #[test]
    fn explicit_flags_win() {
        assert_eq!(server_url(Some("http://gpu-box:8000")), "http://gpu-box:8000");
        assert_eq!(tmp_dir(Some(Path::new("/scratch"))), PathBuf::from("/scratch"));
        assert_eq!(timeout(Some(30)), Duration::from_secs(30));
        assert_eq!(timeout(Some(0)), Duration::from_secs(1));
    }
}

use std::path::Path;

use chrono::Utc;

pub trait PathExt {
    fn ext_lower(&self) -> String;
}

impl PathExt for Path {
    fn ext_lower(&self) -> String {
        self.extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default()
    }
}

/// Lowercased extension of a filename, empty when there is none.
pub fn filename_ext(name: &str) -> String {
    Path::new(name).ext_lower()
}

/// Storage key of the original upload: `original.<ext>` inside the photo's
/// folder.
pub fn original_object_name(original_name: &str) -> String {
    let ext = filename_ext(original_name);
    if ext.is_empty() {
        "original".to_string()
    } else {
        format!("original.{ext}")
    }
}

pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn original_object_name_keeps_lowercased_extension() {
        assert_eq!(original_object_name("DSC_0001.JPG"), "original.jpg");
        assert_eq!(original_object_name("scan.tiff"), "original.tiff");
        assert_eq!(original_object_name("no-extension"), "original");
    }
}

use std::path::Path;
use tracing::debug;

/// Pick the first candidate that exists, else the bare command name (looked up via PATH)
pub fn resolve_binary<F>(candidates: &[String], fallback: &str, exists: F) -> String
where
    F: Fn(&Path) -> bool,
{
    match candidates.iter().find(|c| exists(Path::new(c.as_str()))) {
        Some(found) => {
            debug!("Resolved {} to {}", fallback, found);
            found.clone()
        }
        None => {
            debug!("No candidate for {} found on disk, using PATH lookup", fallback);
            fallback.to_string()
        }
    }
}

/// `resolve_binary` against the real filesystem
pub fn resolve_on_disk(candidates: &[String], fallback: &str) -> String {
    resolve_binary(candidates, fallback, |path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<String> {
        vec![
            "/opt/ffmpeg/bin/ffmpeg".to_string(),
            "/usr/local/bin/ffmpeg".to_string(),
            "/usr/bin/ffmpeg".to_string(),
        ]
    }

    #[test]
    fn test_first_existing_candidate_wins() {
        let resolved = resolve_binary(&candidates(), "ffmpeg", |p| {
            p == Path::new("/usr/local/bin/ffmpeg") || p == Path::new("/usr/bin/ffmpeg")
        });
        assert_eq!(resolved, "/usr/local/bin/ffmpeg");
    }

    #[test]
    fn test_falls_back_to_command_name() {
        assert_eq!(resolve_binary(&candidates(), "ffmpeg", |_| false), "ffmpeg");
        assert_eq!(resolve_binary(&[], "ffprobe", |_| true), "ffprobe");
    }

    #[test]
    fn test_resolve_on_disk_ignores_directories() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("ffprobe");
        std::fs::write(&binary, b"").unwrap();

        let list = vec![
            dir.path().to_string_lossy().to_string(),
            binary.to_string_lossy().to_string(),
        ];
        assert_eq!(resolve_on_disk(&list, "ffprobe"), binary.to_string_lossy());
    }
}

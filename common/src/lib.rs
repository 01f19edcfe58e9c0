//! Common code shared between `annotate_server` and the clients talking to it.
pub mod protocol;

/// Shown while no video has been uploaded.
pub const IDLE_PROMPT: &str = "Upload a video to start processing.";

/// Shown once after the last frame of a video has been displayed.
pub const COMPLETE_MESSAGE: &str = "Video processing complete.";

/// Container formats the upload control accepts, as file extensions.
pub const ACCEPTED_FORMATS: [&str; 4] = ["mp4", "mov", "avi", "mkv"];

/// Check whether a file name carries one of the accepted container extensions.
///
/// The comparison ignores ASCII case, so `clip.MP4` is accepted.
pub fn accepted_extension(filename: &str) -> Option<&'static str> {
    let (_, ext) = filename.rsplit_once('.')?;
    ACCEPTED_FORMATS
        .iter()
        .find(|accepted| accepted.eq_ignore_ascii_case(ext))
        .copied()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_accepted_extension() {
        assert_eq!(accepted_extension("match.mp4"), Some("mp4"));
        assert_eq!(accepted_extension("Match.Final.MKV"), Some("mkv"));
        assert_eq!(accepted_extension("clip.mov"), Some("mov"));
        assert_eq!(accepted_extension("clip.avi"), Some("avi"));
        assert_eq!(accepted_extension("clip.webm"), None);
        assert_eq!(accepted_extension("mp4"), None);
        assert_eq!(accepted_extension(""), None);
    }
}

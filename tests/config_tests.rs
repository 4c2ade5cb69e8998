// Integration tests for layered configuration loading

use loqa_live::Config;
use std::io::Write;
use std::time::Duration;

fn write_config(contents: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loqa-live.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    let path = path.to_string_lossy().into_owned();
    (dir, path)
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent");

    let cfg = Config::load(&path.to_string_lossy()).unwrap();

    assert_eq!(cfg.live.model, "gemini-2.5-flash-native-audio-preview-09-2025");
    assert_eq!(cfg.live.voice, "Kore");
    assert_eq!(cfg.audio.input_sample_rate, 16000);
    assert_eq!(cfg.audio.output_sample_rate, 24000);
    assert_eq!(cfg.audio.frame_size, 4096);
    assert_eq!(cfg.http.port, 3030);
}

#[test]
fn test_file_overrides_defaults() {
    let (_dir, path) = write_config(
        r#"
[live]
voice = "Puck"
system_instruction = "Answer in one sentence."
api_key = "file-key"
connect_timeout_secs = 5

[audio]
frame_size = 2048
output_device = "Headphones"

[http]
port = 8088
"#,
    );

    let cfg = Config::load(&path).unwrap();

    assert_eq!(cfg.live.voice, "Puck");
    assert_eq!(cfg.live.model, "gemini-2.5-flash-native-audio-preview-09-2025");
    assert_eq!(cfg.live.api_key.as_deref(), Some("file-key"));
    assert_eq!(cfg.audio.frame_size, 2048);
    assert_eq!(cfg.audio.output_device.as_deref(), Some("Headphones"));
    assert!(cfg.audio.input_device.is_none());
    assert_eq!(cfg.http_addr(), "127.0.0.1:8088");
}

#[test]
fn test_session_config_mapping() {
    let (_dir, path) = write_config(
        r#"
[live]
model = "models/custom-live"
api_key = "k"
connect_timeout_secs = 3

[audio]
input_sample_rate = 16000
output_sample_rate = 22050
frame_size = 1024
"#,
    );

    let session = Config::load(&path).unwrap().session_config();

    assert_eq!(session.model, "models/custom-live");
    assert_eq!(session.api_key.as_deref(), Some("k"));
    assert_eq!(session.output_sample_rate, 22050);
    assert_eq!(session.frame_size, 1024);
    assert_eq!(session.connect_timeout, Duration::from_secs(3));
    assert!(session.validate().is_ok());
}

#[test]
fn test_malformed_file_is_an_error() {
    let (_dir, path) = write_config("[audio]\nframe_size = \"lots\"\n");
    assert!(Config::load(&path).is_err());
}

//! Encoder invocation
//!
//! The recorder never re-encodes. The encoder stream-copies the source into
//! two sinks at once: a rolling HLS preview in the session directory and a
//! raw MPEG-TS stream on stdout, which the stream writer appends to the
//! archive.

use std::path::Path;
use std::process::Command;

/// Everything an encoder needs to know about one session
#[derive(Debug, Clone, Copy)]
pub struct EncodeTarget<'a> {
    pub source_locator: &'a str,
    pub session_dir: &'a Path,
    pub manifest_path: &'a Path,
}

/// Builds the encoder process for a session.
///
/// Implementations only describe the command; the registry owns stdio
/// wiring (stdout piped to the writer, stderr to the session log).
pub trait EncodeCommand: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    fn build(&self, target: &EncodeTarget<'_>) -> Command;
}

/// FFmpeg with a `tee` muxer: `pipe:1` (mpegts) plus a rolling HLS playlist
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    pub ffmpeg_path: String,
    /// Target segment duration in seconds
    pub hls_time: u32,
    /// Segments kept in the playlist; older ones are deleted
    pub hls_list_size: u32,
    /// Upper bound for the input reconnect delay in seconds
    pub reconnect_delay_max: u32,
}

impl Default for FfmpegCommand {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            hls_time: 4,
            hls_list_size: 6,
            reconnect_delay_max: 30,
        }
    }
}

impl FfmpegCommand {
    /// The `tee` output specification
    pub fn tee_spec(&self, target: &EncodeTarget<'_>) -> String {
        let segments = target.session_dir.join(super::layout::SEGMENT_PATTERN);
        format!(
            "[f=mpegts]pipe:1|[f=hls:hls_time={}:hls_list_size={}:hls_flags=delete_segments+append_list+omit_endlist:hls_segment_filename={}]{}",
            self.hls_time,
            self.hls_list_size,
            segments.display(),
            target.manifest_path.display()
        )
    }

    pub fn args(&self, target: &EncodeTarget<'_>) -> Vec<String> {
        let mut args: Vec<String> = [
            "-nostdin",
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-fflags",
            "+genpts",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        // Reconnect on input drop
        args.extend([
            "-reconnect".to_string(),
            "1".to_string(),
            "-reconnect_streamed".to_string(),
            "1".to_string(),
            "-reconnect_delay_max".to_string(),
            self.reconnect_delay_max.to_string(),
        ]);

        args.extend(["-i".to_string(), target.source_locator.to_string()]);

        // Stream copy, every input stream
        args.extend([
            "-map".to_string(),
            "0".to_string(),
            "-c".to_string(),
            "copy".to_string(),
        ]);

        args.extend(["-f".to_string(), "tee".to_string(), self.tee_spec(target)]);
        args
    }
}

impl EncodeCommand for FfmpegCommand {
    fn name(&self) -> &str {
        &self.ffmpeg_path
    }

    fn build(&self, target: &EncodeTarget<'_>) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(self.args(target));
        cmd
    }
}

/// A user supplied `sh -c` pipeline in place of FFmpeg.
///
/// The script must write the archive stream to stdout and may write the
/// preview into `$STREAMREC_SESSION_DIR`. It receives:
/// - `STREAMREC_SOURCE`: the source locator
/// - `STREAMREC_SESSION_DIR`: the ephemeral session directory
/// - `STREAMREC_MANIFEST`: where the preview manifest is expected
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub script: String,
}

impl ShellCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl EncodeCommand for ShellCommand {
    fn name(&self) -> &str {
        "sh"
    }

    fn build(&self, target: &EncodeTarget<'_>) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.script)
            .env("STREAMREC_SOURCE", target.source_locator)
            .env("STREAMREC_SESSION_DIR", target.session_dir)
            .env("STREAMREC_MANIFEST", target.manifest_path);
        cmd
    }
}

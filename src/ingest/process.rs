//! External camera process.
//!
//! Stream mode spawns a camera program that writes MJPEG to stdout. The
//! process is killed and reaped when the source is closed or dropped.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};

use crate::frame::FrameShape;

/// Default camera program for stream mode.
pub const DEFAULT_CAMERA_PROGRAM: &str = "libcamera-vid";

/// Build the default `libcamera-vid` invocation for `shape` at `fps`.
pub fn libcamera_command(shape: FrameShape, fps: u32) -> Vec<String> {
    vec![
        DEFAULT_CAMERA_PROGRAM.to_string(),
        "--codec".to_string(),
        "mjpeg".to_string(),
        "--inline".to_string(),
        "-o".to_string(),
        "-".to_string(),
        "-t".to_string(),
        "0".to_string(),
        "--width".to_string(),
        shape.width.to_string(),
        "--height".to_string(),
        shape.height.to_string(),
        "--framerate".to_string(),
        fps.to_string(),
    ]
}

pub struct CameraProcess {
    program: String,
    child: Option<Child>,
}

impl CameraProcess {
    /// Spawn `command[0]` with the remaining elements as arguments.
    ///
    /// Returns the handle and the child's stdout.
    pub fn spawn(command: &[String]) -> Result<(Self, ChildStdout)> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("camera command is empty"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn camera process {}", program))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("camera process {} has no stdout", program))?;
        log::info!("CameraProcess: started {} (pid {})", program, child.id());
        Ok((
            Self {
                program: program.clone(),
                child: Some(child),
            },
            stdout,
        ))
    }

    /// True while the child has not exited.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Kill and reap the child. Safe to call more than once.
    pub fn terminate(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if let Ok(Some(status)) = child.try_wait() {
            log::info!("CameraProcess: {} already exited ({})", self.program, status);
            return Ok(());
        }
        child
            .kill()
            .with_context(|| format!("kill camera process {}", self.program))?;
        let status = child
            .wait()
            .with_context(|| format!("reap camera process {}", self.program))?;
        log::info!("CameraProcess: {} terminated ({})", self.program, status);
        Ok(())
    }
}

impl Drop for CameraProcess {
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            log::warn!("CameraProcess: {}", err);
        }
    }
}

/// Boxed reader type used for every stream-mode input.
pub type ByteStream = Box<dyn Read + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_command_carries_geometry_and_rate() {
        let cmd = libcamera_command(FrameShape::new(960, 540), 30);
        assert_eq!(cmd[0], "libcamera-vid");
        let joined = cmd.join(" ");
        assert!(joined.contains("--codec mjpeg"));
        assert!(joined.contains("--width 960 --height 540 --framerate 30"));
        assert!(joined.contains("-o - -t 0"));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CameraProcess::spawn(&[]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn spawned_process_streams_stdout_and_terminates() -> Result<()> {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf abc; sleep 30".to_string(),
        ];
        let (mut process, mut stdout) = CameraProcess::spawn(&command)?;
        let mut buf = [0u8; 3];
        stdout.read_exact(&mut buf)?;
        assert_eq!(&buf, b"abc");
        assert!(process.is_running());
        process.terminate()?;
        assert!(!process.is_running());
        process.terminate()?;
        Ok(())
    }
}

//! Edge Impulse Linux model runner.
//!
//! An `.eim` file is a self-contained executable. Started with a socket path
//! as its only argument it listens on that Unix socket and answers
//! newline-free JSON requests, each response terminated by a NUL byte:
//!
//! - `{"hello": 1, "id": n}` returns model parameters and project info
//! - `{"classify": [features...], "id": n}` returns bounding boxes
//!
//! The runner process lives as long as the engine and is killed on drop.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::detect::backend::{InferenceEngine, ModelInfo};
use crate::detect::features::{extract_packed_features, Features};
use crate::detect::result::{BoundingBox, ModelInput, RawBoundingBox};

const SOCKET_WAIT: Duration = Duration::from_secs(10);
const SOCKET_POLL: Duration = Duration::from_millis(100);

pub struct EimEngine {
    model_path: PathBuf,
    socket_path: PathBuf,
    child: Option<Child>,
    session: Option<Session>,
    input: Option<ModelInput>,
    next_id: u64,
}

struct Session {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

#[derive(Debug, Deserialize)]
struct HelloResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    model_parameters: Option<ModelParameters>,
    #[serde(default)]
    project: Option<ProjectInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelParameters {
    image_input_width: u32,
    image_input_height: u32,
    #[serde(default = "default_channels")]
    image_channel_count: u32,
    #[serde(default)]
    labels: Vec<String>,
}

fn default_channels() -> u32 {
    3
}

#[derive(Debug, Deserialize)]
struct ProjectInfo {
    #[serde(default)]
    name: String,
    #[serde(default)]
    owner: String,
    #[serde(default)]
    deploy_version: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    result: Option<ClassifyResult>,
}

#[derive(Debug, Deserialize)]
struct ClassifyResult {
    #[serde(default)]
    bounding_boxes: Vec<RawBoundingBox>,
}

impl EimEngine {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        let socket_path = std::env::temp_dir().join(format!(
            "camera-streamer-{}-{:08x}.sock",
            std::process::id(),
            rand::thread_rng().gen::<u32>()
        ));
        Self {
            model_path: model_path.into(),
            socket_path,
            child: None,
            session: None,
            input: None,
            next_id: 1,
        }
    }

    fn spawn_runner(&mut self) -> Result<()> {
        if !self.model_path.is_file() {
            return Err(anyhow!("model file {} not found", self.model_path.display()));
        }
        ensure_executable(&self.model_path)?;
        let _ = std::fs::remove_file(&self.socket_path);

        let mut child = Command::new(&self.model_path)
            .arg(&self.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("start model runner {}", self.model_path.display()))?;

        let deadline = Instant::now() + SOCKET_WAIT;
        let stream = loop {
            if let Some(status) = child.try_wait().context("poll model runner")? {
                return Err(anyhow!("model runner exited during start-up ({})", status));
            }
            if self.socket_path.exists() {
                if let Ok(stream) = UnixStream::connect(&self.socket_path) {
                    break stream;
                }
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!(
                    "model runner did not open {} within {:?}",
                    self.socket_path.display(),
                    SOCKET_WAIT
                ));
            }
            std::thread::sleep(SOCKET_POLL);
        };

        let writer = stream.try_clone().context("clone runner socket")?;
        self.session = Some(Session {
            reader: BufReader::new(stream),
            writer,
        });
        self.child = Some(child);
        Ok(())
    }

    fn request<T: for<'de> Deserialize<'de>>(&mut self, mut body: serde_json::Value) -> Result<T> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("model runner not initialized"))?;
        body["id"] = json!(self.next_id);
        self.next_id += 1;

        let payload = serde_json::to_vec(&body)?;
        session
            .writer
            .write_all(&payload)
            .context("send request to model runner")?;

        let mut response = Vec::new();
        let read = session
            .reader
            .read_until(0, &mut response)
            .context("read model runner response")?;
        if read == 0 {
            return Err(anyhow!("model runner closed the connection"));
        }
        if response.last() == Some(&0) {
            response.pop();
        }
        serde_json::from_slice(&response).context("parse model runner response")
    }

    fn shutdown(&mut self) {
        self.session = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl InferenceEngine for EimEngine {
    fn name(&self) -> &str {
        "eim"
    }

    fn init(&mut self) -> Result<ModelInfo> {
        self.spawn_runner()?;
        let hello: HelloResponse = self.request(json!({ "hello": 1 }))?;
        if !hello.success {
            return Err(anyhow!(
                "model runner rejected hello: {}",
                hello.error.unwrap_or_else(|| "unknown error".to_string())
            ));
        }
        let params = hello
            .model_parameters
            .ok_or_else(|| anyhow!("model runner sent no model parameters"))?;
        let input = ModelInput {
            width: params.image_input_width,
            height: params.image_input_height,
            channels: params.image_channel_count,
        };
        self.input = Some(input);

        let version = match hello.project {
            Some(project) => match project.deploy_version {
                Some(v) => format!("{}/{} v{}", project.owner, project.name, v),
                None => format!("{}/{}", project.owner, project.name),
            },
            None => self.model_path.display().to_string(),
        };
        log::info!(
            "EimEngine: loaded {} ({}x{}x{}, {} labels)",
            version,
            input.width,
            input.height,
            input.channels,
            params.labels.len()
        );
        Ok(ModelInfo {
            input,
            labels: params.labels,
            version,
        })
    }

    fn extract_features(&mut self, frame: &RgbImage) -> Result<Features> {
        let input = self
            .input
            .ok_or_else(|| anyhow!("model runner not initialized"))?;
        extract_packed_features(frame, input)
    }

    fn classify(&mut self, features: &Features) -> Result<Vec<BoundingBox>> {
        let response: ClassifyResponse =
            self.request(json!({ "classify": features.values }))?;
        if !response.success {
            return Err(anyhow!(
                "classification failed: {}",
                response.error.unwrap_or_else(|| "unknown error".to_string())
            ));
        }
        let raw = response.result.map(|r| r.bounding_boxes).unwrap_or_default();
        let total = raw.len();
        let boxes: Vec<BoundingBox> = raw
            .iter()
            .filter_map(|bb| BoundingBox::from_raw(bb, features.input))
            .collect();
        if boxes.len() < total {
            log::warn!(
                "EimEngine: discarded {} malformed bounding boxes",
                total - boxes.len()
            );
        }
        Ok(boxes)
    }
}

impl Drop for EimEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn ensure_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path)
        .with_context(|| format!("stat model file {}", path.display()))?;
    let mut perms = metadata.permissions();
    if perms.mode() & 0o111 == 0 {
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("mark model file {} executable", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_fails_init() {
        let mut engine = EimEngine::new("/nonexistent/model.eim");
        let err = engine.init().unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn parses_runner_responses() {
        let hello: HelloResponse = serde_json::from_str(
            r#"{"id":1,"success":true,"model_parameters":{"image_input_width":320,
                "image_input_height":320,"image_channel_count":3,"labels":["cat_face"]},
                "project":{"name":"parsley","owner":"rover","deploy_version":4}}"#,
        )
        .unwrap();
        assert!(hello.success);
        assert_eq!(hello.model_parameters.unwrap().labels, vec!["cat_face"]);

        let classify: ClassifyResponse = serde_json::from_str(
            r#"{"id":2,"success":true,"result":{"bounding_boxes":[
                {"label":"cat_face","value":0.62,"x":216,"y":112,"width":8,"height":8}]}}"#,
        )
        .unwrap();
        assert_eq!(classify.result.unwrap().bounding_boxes.len(), 1);

        let failed: ClassifyResponse =
            serde_json::from_str(r#"{"id":3,"success":false,"error":"bad features"}"#).unwrap();
        assert_eq!(failed.error.as_deref(), Some("bad features"));
    }

    #[test]
    fn classify_before_init_is_an_error() {
        let mut engine = EimEngine::new("/nonexistent/model.eim");
        let features = Features {
            input: ModelInput::default(),
            values: vec![0; 4],
        };
        assert!(engine.classify(&features).is_err());
    }
}

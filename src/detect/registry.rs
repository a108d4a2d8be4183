use anyhow::{anyhow, Result};
use std::path::PathBuf;

use super::backend::InferenceEngine;
use super::backends::StubEngine;
use super::result::ModelInput;

/// Parsed inference engine identity.
///
/// - `stub://` or `stub://<name>`: one centred box per frame
/// - `stub://empty`: no boxes
/// - anything else: path to an Edge Impulse `.eim` model
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineSpec {
    Stub,
    StubEmpty,
    Eim(PathBuf),
}

impl EngineSpec {
    pub fn parse(identity: &str) -> Result<Self> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(anyhow!("inference engine identity is empty"));
        }
        if let Some(name) = identity.strip_prefix("stub://") {
            return Ok(match name {
                "empty" => Self::StubEmpty,
                _ => Self::Stub,
            });
        }
        Ok(Self::Eim(PathBuf::from(identity)))
    }
}

/// Construct the engine named by `identity`. The engine is not initialized.
///
/// `input` is the model geometry for engines that cannot report their own.
pub fn open_engine(identity: &str, input: ModelInput) -> Result<Box<dyn InferenceEngine>> {
    match EngineSpec::parse(identity)? {
        EngineSpec::Stub => Ok(Box::new(StubEngine::centered(input))),
        EngineSpec::StubEmpty => Ok(Box::new(StubEngine::empty(input))),
        #[cfg(unix)]
        EngineSpec::Eim(path) => Ok(Box::new(super::backends::EimEngine::new(path))),
        #[cfg(not(unix))]
        EngineSpec::Eim(path) => Err(anyhow!(
            "model runner {} requires a unix platform",
            path.display()
        )),
    }
}

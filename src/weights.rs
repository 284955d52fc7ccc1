//! Locating and memory-mapping pretrained weights.
use std::path::{Path, PathBuf};

use candle::{DType, Device, Result};
use candle_nn::VarBuilder;

const HUB_URL_PREFIX: &str = "https://huggingface.co/";

/// Where a safetensors checkpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightSource {
    Local(PathBuf),
    Hub {
        repo: String,
        revision: Option<String>,
        file: String,
    },
}

fn split_repo(s: &str) -> Option<(&str, &str)> {
    let mut parts = s.splitn(3, '/');
    let owner = parts.next()?;
    let name = parts.next()?;
    let rest = parts.next()?;
    if owner.is_empty() || name.is_empty() || rest.is_empty() {
        return None;
    }
    Some((&s[..owner.len() + 1 + name.len()], rest))
}

impl WeightSource {
    /// Accepted forms:
    /// - `hf://owner/repo/path/to/model.safetensors`, `hf://owner/repo@revision/path/...`
    /// - `https://huggingface.co/owner/repo/resolve/<revision>/path/to/model.safetensors`
    /// - anything else is a local path.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("hf://") {
            let (repo, file) = match split_repo(rest) {
                Some(v) => v,
                None => candle::bail!("invalid hub reference {s}, expected hf://owner/repo/file"),
            };
            let (repo, revision) = match repo.split_once('@') {
                Some((repo, revision)) => (repo, Some(revision.to_string())),
                None => (repo, None),
            };
            return Ok(Self::Hub {
                repo: repo.to_string(),
                revision,
                file: file.to_string(),
            });
        }
        if let Some(rest) = s.strip_prefix(HUB_URL_PREFIX) {
            let parsed = split_repo(rest).and_then(|(repo, rest)| {
                let rest = rest.strip_prefix("resolve/")?;
                let (revision, file) = rest.split_once('/')?;
                Some((repo, revision, file))
            });
            return match parsed {
                Some((repo, revision, file)) if !file.is_empty() => Ok(Self::Hub {
                    repo: repo.to_string(),
                    revision: Some(revision.to_string()),
                    file: file.to_string(),
                }),
                _ => candle::bail!(
                    "unsupported hub url {s}, expected {HUB_URL_PREFIX}owner/repo/resolve/revision/file"
                ),
            };
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            candle::bail!("only huggingface.co urls are supported for weights, got {s}")
        }
        Ok(Self::Local(PathBuf::from(s)))
    }

    /// Returns a local path to the weights, downloading them to the hub cache if needed.
    pub fn resolve(&self) -> Result<PathBuf> {
        match self {
            Self::Local(path) => {
                if !path.is_file() {
                    candle::bail!("weights file {path:?} does not exist")
                }
                Ok(path.clone())
            }
            Self::Hub {
                repo,
                revision,
                file,
            } => {
                tracing::debug!(%repo, ?revision, %file, "fetching weights from the hub");
                let api = hf_hub::api::sync::Api::new().map_err(candle::Error::wrap)?;
                let repo = match revision {
                    Some(revision) => hf_hub::Repo::with_revision(
                        repo.clone(),
                        hf_hub::RepoType::Model,
                        revision.clone(),
                    ),
                    None => hf_hub::Repo::model(repo.clone()),
                };
                api.repo(repo).get(file).map_err(candle::Error::wrap)
            }
        }
    }
}

impl std::str::FromStr for WeightSource {
    type Err = candle::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Memory-maps safetensors files into a [`VarBuilder`].
pub fn var_builder<'a, P: AsRef<Path>>(
    paths: &[P],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'a>> {
    // SAFETY: the files are expected not to be modified while the model is alive.
    unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hub_reference() -> Result<()> {
        assert_eq!(
            WeightSource::parse("hf://lmz/candle-resnet/resnet18.safetensors")?,
            WeightSource::Hub {
                repo: "lmz/candle-resnet".to_string(),
                revision: None,
                file: "resnet18.safetensors".to_string(),
            }
        );
        assert_eq!(
            WeightSource::parse("hf://org/upernet@v1.0/weights/model.safetensors")?,
            WeightSource::Hub {
                repo: "org/upernet".to_string(),
                revision: Some("v1.0".to_string()),
                file: "weights/model.safetensors".to_string(),
            }
        );
        assert!(WeightSource::parse("hf://org/model.safetensors").is_err());
        Ok(())
    }

    #[test]
    fn parse_hub_url() -> Result<()> {
        assert_eq!(
            WeightSource::parse(
                "https://huggingface.co/org/upernet/resolve/main/model.safetensors"
            )?,
            WeightSource::Hub {
                repo: "org/upernet".to_string(),
                revision: Some("main".to_string()),
                file: "model.safetensors".to_string(),
            }
        );
        assert!(WeightSource::parse("https://huggingface.co/org/upernet/blob/main/m").is_err());
        assert!(WeightSource::parse("https://example.com/model.safetensors").is_err());
        Ok(())
    }

    #[test]
    fn local_paths() -> Result<()> {
        let source: WeightSource = "weights/model.safetensors".parse()?;
        assert_eq!(
            source,
            WeightSource::Local(PathBuf::from("weights/model.safetensors"))
        );
        assert!(source.resolve().is_err());
        Ok(())
    }
}

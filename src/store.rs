//! Model stores: where descriptors and model files come from.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::model::descriptor::{DescriptorError, ModelDescriptor};

/// Name of the file a remote store serves as the engine init script.
pub const INIT_SCRIPT: &str = "initscript";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("model '{model}' not found in {location}")]
    ModelNotFound { model: String, location: String },
    #[error("file '{file}' of model '{model}' not found")]
    FileNotFound { model: String, file: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },
    #[error("failed to read response body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Source of model descriptors and model files.
pub trait ModelStore: fmt::Debug + Send + Sync {
    fn load(&self, model: &str) -> Result<ModelDescriptor, StoreError>;

    fn fetch_file(&self, model: &str, file: &str) -> Result<Vec<u8>, StoreError>;

    /// On-disk location of a model file, if the store is local.
    fn local_path(&self, model: &str, file: &str) -> Option<PathBuf>;

    fn is_remote(&self) -> bool;

    /// Settings a worker process can reopen this store from.
    fn config(&self) -> Option<StoreConfig> {
        None
    }
}

/// Serializable store selection (settings file, worker command line).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    Local { root: PathBuf },
    Remote { url: String },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Local {
            root: PathBuf::from("models"),
        }
    }
}

impl StoreConfig {
    pub fn open(&self) -> Arc<dyn ModelStore> {
        match self {
            StoreConfig::Local { root } => Arc::new(LocalStore::new(root)),
            StoreConfig::Remote { url } => Arc::new(RemoteStore::new(url)),
        }
    }
}

/// Models stored as `<root>/<model>.json` plus files under the first
/// existing `dbdirs` entry of the descriptor (or `root` itself).
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
    file_dirs: Mutex<HashMap<String, PathBuf>>,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file_dirs: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn descriptor_path(&self, model: &str) -> PathBuf {
        self.root.join(format!("{model}.json"))
    }

    /// Directory model files are read from, resolved once per model.
    fn file_dir(&self, model: &str) -> Result<PathBuf, StoreError> {
        let mut cache = self
            .file_dirs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(dir) = cache.get(model) {
            return Ok(dir.clone());
        }
        let descriptor = self.load(model)?;
        let dir = descriptor
            .dbdirs
            .iter()
            .map(|d| self.root.join(d))
            .find(|d| d.is_dir())
            .unwrap_or_else(|| self.root.clone());
        log::debug!("[STORE] Model '{model}' files resolve under {}", dir.display());
        cache.insert(model.to_string(), dir.clone());
        Ok(dir)
    }
}

impl ModelStore for LocalStore {
    fn load(&self, model: &str) -> Result<ModelDescriptor, StoreError> {
        let path = self.descriptor_path(model);
        if !path.is_file() {
            return Err(StoreError::ModelNotFound {
                model: model.to_string(),
                location: self.root.display().to_string(),
            });
        }
        let bytes = fs::read(&path).map_err(|source| StoreError::Io { path, source })?;
        Ok(ModelDescriptor::from_json(&bytes)?)
    }

    fn fetch_file(&self, model: &str, file: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.file_dir(model)?.join(file);
        if !path.is_file() {
            return Err(StoreError::FileNotFound {
                model: model.to_string(),
                file: file.to_string(),
            });
        }
        fs::read(&path).map_err(|source| StoreError::Io { path, source })
    }

    fn local_path(&self, model: &str, file: &str) -> Option<PathBuf> {
        let path = self.file_dir(model).ok()?.join(file);
        path.is_file().then_some(path)
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn config(&self) -> Option<StoreConfig> {
        Some(StoreConfig::Local {
            root: self.root.clone(),
        })
    }
}

/// Models served over HTTP: descriptor at `{base}/{model}`, files at
/// `{base}/{model}/{file}`.
#[derive(Debug, Clone)]
pub struct RemoteStore {
    base_url: String,
}

impl RemoteStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn descriptor_url(&self, model: &str) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(model))
    }

    pub fn file_url(&self, model: &str, file: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            urlencoding::encode(model),
            urlencoding::encode(file)
        )
    }

    fn get(&self, url: &str) -> Result<Vec<u8>, StoreError> {
        log::debug!("[STORE] GET {url}");
        let response = ureq::get(url).call().map_err(|source| StoreError::Http {
            url: url.to_string(),
            source: Box::new(source),
        })?;
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|source| StoreError::Body {
                url: url.to_string(),
                source,
            })?;
        Ok(body)
    }
}

impl ModelStore for RemoteStore {
    fn load(&self, model: &str) -> Result<ModelDescriptor, StoreError> {
        match self.get(&self.descriptor_url(model)) {
            Ok(bytes) => Ok(ModelDescriptor::from_json(&bytes)?),
            Err(StoreError::Http { source, .. }) if is_not_found(&source) => {
                Err(StoreError::ModelNotFound {
                    model: model.to_string(),
                    location: self.base_url.clone(),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn fetch_file(&self, model: &str, file: &str) -> Result<Vec<u8>, StoreError> {
        match self.get(&self.file_url(model, file)) {
            Err(StoreError::Http { source, .. }) if is_not_found(&source) => {
                Err(StoreError::FileNotFound {
                    model: model.to_string(),
                    file: file.to_string(),
                })
            }
            other => other,
        }
    }

    fn local_path(&self, _model: &str, _file: &str) -> Option<PathBuf> {
        None
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn config(&self) -> Option<StoreConfig> {
        Some(StoreConfig::Remote {
            url: self.base_url.clone(),
        })
    }
}

fn is_not_found(error: &ureq::Error) -> bool {
    matches!(error, ureq::Error::Status(404, _))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::descriptor::tests::SAMPLE;

    /// Serves `SAMPLE` as model `lebt` plus the given files, like a remote
    /// store would.
    #[derive(Debug, Default)]
    pub(crate) struct MemoryStore {
        pub(crate) files: HashMap<String, Vec<u8>>,
    }

    impl MemoryStore {
        pub(crate) fn with_files(files: &[(&str, &str)]) -> Self {
            Self {
                files: files
                    .iter()
                    .map(|(name, content)| (name.to_string(), content.as_bytes().to_vec()))
                    .collect(),
            }
        }
    }

    impl ModelStore for MemoryStore {
        fn load(&self, model: &str) -> Result<ModelDescriptor, StoreError> {
            if model != "lebt" {
                return Err(StoreError::ModelNotFound {
                    model: model.to_string(),
                    location: "memory".to_string(),
                });
            }
            Ok(ModelDescriptor::from_json(SAMPLE.as_bytes())?)
        }

        fn fetch_file(&self, model: &str, file: &str) -> Result<Vec<u8>, StoreError> {
            self.files.get(file).cloned().ok_or_else(|| StoreError::FileNotFound {
                model: model.to_string(),
                file: file.to_string(),
            })
        }

        fn local_path(&self, _model: &str, _file: &str) -> Option<PathBuf> {
            None
        }

        fn is_remote(&self) -> bool {
            true
        }
    }

    fn local_fixture() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("lebt.json"), SAMPLE).unwrap();
        fs::create_dir(dir.path().join("db")).unwrap();
        fs::write(dir.path().join("db").join("f1.str"), "qp_k1 = 2;\n").unwrap();
        let store = LocalStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_local_load_and_fetch() {
        let (dir, store) = local_fixture();
        let descriptor = store.load("lebt").unwrap();
        assert_eq!(descriptor.sequence, "lebt.seq");
        assert_eq!(store.fetch_file("lebt", "f1.str").unwrap(), b"qp_k1 = 2;\n");
        assert!(store.local_path("lebt", "f1.str").unwrap().ends_with("db/f1.str"));
        assert!(!store.is_remote());
        assert_eq!(
            store.config(),
            Some(StoreConfig::Local {
                root: dir.path().to_path_buf()
            })
        );
    }

    #[test]
    fn test_local_falls_back_to_root_without_dbdirs() {
        let (dir, store) = local_fixture();
        fs::remove_dir_all(dir.path().join("db")).unwrap();
        fs::write(dir.path().join("f1.str"), "x = 1;").unwrap();
        assert_eq!(store.fetch_file("lebt", "f1.str").unwrap(), b"x = 1;");
    }

    #[test]
    fn test_local_missing_model_and_file() {
        let (_dir, store) = local_fixture();
        assert!(matches!(
            store.load("nope"),
            Err(StoreError::ModelNotFound { .. })
        ));
        assert!(matches!(
            store.fetch_file("lebt", "missing.str"),
            Err(StoreError::FileNotFound { .. })
        ));
        assert!(store.local_path("lebt", "missing.str").is_none());
    }

    #[test]
    fn test_remote_urls() {
        let store = RemoteStore::new("http://models.example/db/");
        assert_eq!(store.descriptor_url("lhc"), "http://models.example/db/lhc");
        assert_eq!(
            store.file_url("lhc", "v6.5 inj.str"),
            "http://models.example/db/lhc/v6.5%20inj.str"
        );
        assert!(store.is_remote());
        assert!(store.local_path("lhc", "x").is_none());
    }

    #[test]
    fn test_store_config_json() {
        let cfg: StoreConfig =
            serde_json::from_str(r#"{"kind": "remote", "url": "http://x"}"#).unwrap();
        assert_eq!(cfg, StoreConfig::Remote { url: "http://x".into() });
        assert!(cfg.open().is_remote());
        assert!(!StoreConfig::default().open().is_remote());
    }
}

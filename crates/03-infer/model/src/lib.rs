//! Model packages: manifest parsing, shape/layout queries and the
//! process-wide model cache.
//!
//! A model package is a JSON manifest naming the model and describing every
//! input and output tensor (dims, element type, dimension order). Loading a
//! package produces a shared [`Model`]; the [`cache`] module deduplicates
//! loads by url and keeps an LRU of recently used models, sized by the
//! `CNIS_MODEL_CACHE_LIMIT` environment variable (default 3).

mod cache;
mod error;
mod info;
mod manifest;

pub use cache::{clear_model_cache, load_model, unload_model, ModelCache, MODEL_CACHE_LIMIT_ENV};
pub use error::{ModelError, ModelResult};
pub use info::{Model, Shape, TensorLayout};
pub use manifest::{DataType, DimOrder, ModelManifest, TensorDesc};

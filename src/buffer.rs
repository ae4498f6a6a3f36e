use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::comm::P2pHandle;
use crate::data::{CacheData, NamedBatch, TransferData, TransferInfo};
use crate::error::BufferError;
use crate::tensor::{DType, Tensor, TensorMeta};

/// A value parked in the tensor buffer: a tensor, a metadata record, or an
/// in-flight communication handle.
#[derive(Debug)]
pub enum Entry {
    Tensor(Tensor),
    Transfer(TransferData),
    Caches(Vec<CacheData>),
    Info(TransferInfo),
    Batch(NamedBatch),
    Handle(P2pHandle),
    TensorList(Vec<Tensor>),
    MaskList(Vec<Option<Tensor>>),
    BoolVec(Vec<bool>),
    Count(usize),
    Flag(bool),
    Scalar(f64),
    Stats(BTreeMap<String, f64>),
}

macro_rules! typed_take {
    ($name:ident, $variant:ident, $ty:ty, $kind:literal) => {
        pub fn $name(&mut self, tag: &str, micro_batch: usize) -> Result<$ty, BufferError> {
            match self.take(tag, micro_batch)? {
                Entry::$variant(v) => Ok(v),
                other => {
                    // put it back before failing so the bug is observable
                    self.put(tag, micro_batch, other);
                    Err(BufferError::WrongKind {
                        tag: tag.to_string(),
                        micro_batch,
                        expected: $kind,
                    })
                }
            }
        }
    };
}

/// Keyed per-step scratchpad: `(tag, micro-batch) -> value`. Entries are owned
/// by the engine for the duration of one top-level call and must be cleared
/// in the matching post phase.
#[derive(Debug, Default)]
pub struct TensorBuffer {
    slots: HashMap<String, HashMap<usize, Entry>>,
}

impl TensorBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert; overwriting is legal.
    pub fn put(&mut self, tag: &str, micro_batch: usize, value: Entry) {
        self.slots
            .entry(tag.to_string())
            .or_default()
            .insert(micro_batch, value);
    }

    /// Fetch and remove. Missing entries are a bug in the caller.
    pub fn take(&mut self, tag: &str, micro_batch: usize) -> Result<Entry, BufferError> {
        self.try_take(tag, micro_batch)
            .ok_or_else(|| BufferError::Missing {
                tag: tag.to_string(),
                micro_batch,
            })
    }

    /// Fetch and remove, tolerating absence.
    pub fn try_take(&mut self, tag: &str, micro_batch: usize) -> Option<Entry> {
        let slots = self.slots.get_mut(tag)?;
        let v = slots.remove(&micro_batch);
        if slots.is_empty() {
            self.slots.remove(tag);
        }
        v
    }

    pub fn get(&self, tag: &str, micro_batch: usize) -> Result<&Entry, BufferError> {
        self.slots
            .get(tag)
            .and_then(|s| s.get(&micro_batch))
            .ok_or_else(|| BufferError::Missing {
                tag: tag.to_string(),
                micro_batch,
            })
    }

    pub fn get_mut(&mut self, tag: &str, micro_batch: usize) -> Result<&mut Entry, BufferError> {
        self.slots
            .get_mut(tag)
            .and_then(|s| s.get_mut(&micro_batch))
            .ok_or_else(|| BufferError::Missing {
                tag: tag.to_string(),
                micro_batch,
            })
    }

    pub fn contains(&self, tag: &str, micro_batch: usize) -> bool {
        self.slots
            .get(tag)
            .map_or(false, |s| s.contains_key(&micro_batch))
    }

    /// Create an all-zero tensor under `(tag, micro_batch)` and return its
    /// shape/dtype expectation for the matching receive.
    pub fn alloc(
        &mut self,
        tag: &str,
        micro_batch: usize,
        shape: Vec<usize>,
        dtype: DType,
    ) -> TensorMeta {
        let t = Tensor::zeros(shape, dtype);
        let meta = t.meta();
        self.put(tag, micro_batch, Entry::Tensor(t));
        meta
    }

    /// Bulk drop all micro-batch slots of a tag. Used by the post phases.
    pub fn remove_tag(&mut self, tag: &str) {
        self.slots.remove(tag);
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn tags(&self) -> Vec<&str> {
        self.slots.keys().map(String::as_str).collect()
    }

    // Typed take/get helpers. A wrong-kind access is a bug, reported with the
    // tag so it can be traced to the offending handler.

    typed_take!(take_tensor, Tensor, Tensor, "tensor");
    typed_take!(take_transfer, Transfer, TransferData, "transfer");
    typed_take!(take_caches, Caches, Vec<CacheData>, "caches");
    typed_take!(take_batch, Batch, NamedBatch, "batch");
    typed_take!(take_tensor_list, TensorList, Vec<Tensor>, "tensor list");
    typed_take!(take_mask_list, MaskList, Vec<Option<Tensor>>, "mask list");
    typed_take!(take_scalar, Scalar, f64, "scalar");
    typed_take!(take_stats, Stats, BTreeMap<String, f64>, "stats");

    /// Remove and return the communication handle under `(tag, micro_batch)`,
    /// if one was recorded. Handles are always removed on consumption.
    pub fn take_handle(&mut self, tag: &str, micro_batch: usize) -> Option<P2pHandle> {
        match self.try_take(tag, micro_batch) {
            Some(Entry::Handle(h)) => Some(h),
            Some(other) => {
                self.put(tag, micro_batch, other);
                None
            }
            None => None,
        }
    }

    pub fn get_count(&self, tag: &str, micro_batch: usize) -> Result<usize, BufferError> {
        match self.get(tag, micro_batch)? {
            Entry::Count(v) => Ok(*v),
            _ => Err(BufferError::WrongKind {
                tag: tag.to_string(),
                micro_batch,
                expected: "count",
            }),
        }
    }

    pub fn get_flag(&self, tag: &str, micro_batch: usize) -> Result<bool, BufferError> {
        match self.get(tag, micro_batch)? {
            Entry::Flag(v) => Ok(*v),
            _ => Err(BufferError::WrongKind {
                tag: tag.to_string(),
                micro_batch,
                expected: "flag",
            }),
        }
    }

    pub fn get_bool_vec(&self, tag: &str, micro_batch: usize) -> Result<&Vec<bool>, BufferError> {
        match self.get(tag, micro_batch)? {
            Entry::BoolVec(v) => Ok(v),
            _ => Err(BufferError::WrongKind {
                tag: tag.to_string(),
                micro_batch,
                expected: "bool vec",
            }),
        }
    }

    pub fn get_tensor(&self, tag: &str, micro_batch: usize) -> Result<&Tensor, BufferError> {
        match self.get(tag, micro_batch)? {
            Entry::Tensor(v) => Ok(v),
            _ => Err(BufferError::WrongKind {
                tag: tag.to_string(),
                micro_batch,
                expected: "tensor",
            }),
        }
    }

    pub fn get_info(&self, tag: &str, micro_batch: usize) -> Result<&TransferInfo, BufferError> {
        match self.get(tag, micro_batch)? {
            Entry::Info(v) => Ok(v),
            _ => Err(BufferError::WrongKind {
                tag: tag.to_string(),
                micro_batch,
                expected: "info",
            }),
        }
    }

    pub fn caches_mut(
        &mut self,
        tag: &str,
        micro_batch: usize,
    ) -> Result<&mut Vec<CacheData>, BufferError> {
        match self.get_mut(tag, micro_batch)? {
            Entry::Caches(v) => Ok(v),
            _ => Err(BufferError::WrongKind {
                tag: tag.to_string(),
                micro_batch,
                expected: "caches",
            }),
        }
    }

    pub fn tensor_list_mut(
        &mut self,
        tag: &str,
        micro_batch: usize,
    ) -> Result<&mut Vec<Tensor>, BufferError> {
        match self.get_mut(tag, micro_batch)? {
            Entry::TensorList(v) => Ok(v),
            _ => Err(BufferError::WrongKind {
                tag: tag.to_string(),
                micro_batch,
                expected: "tensor list",
            }),
        }
    }

    pub fn mask_list_mut(
        &mut self,
        tag: &str,
        micro_batch: usize,
    ) -> Result<&mut Vec<Option<Tensor>>, BufferError> {
        match self.get_mut(tag, micro_batch)? {
            Entry::MaskList(v) => Ok(v),
            _ => Err(BufferError::WrongKind {
                tag: tag.to_string(),
                micro_batch,
                expected: "mask list",
            }),
        }
    }
}

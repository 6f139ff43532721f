//! `SafeTensors` file access with memory mapping

#![allow(clippy::doc_markdown)]

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use safetensors::tensor::{SafeTensors, TensorView};
use tracing::warn;

use crate::dtype::DType;
use crate::tensor::Tensor;
use crate::{Error, Result};

/// Read-only index over one or more SafeTensors files.
///
/// Files are mapped, not read; tensor bytes are only touched when a tensor
/// (or a slice of one) is requested.
pub(crate) struct SafeTensorsFiles {
    /// Memory-mapped files (kept alive for the lifetime of the index)
    mmaps: Vec<Mmap>,
    tensors: HashMap<String, TensorMeta>,
}

#[derive(Debug, Clone)]
pub(crate) struct TensorMeta {
    file_idx: usize,
    pub shape: Vec<usize>,
    pub dtype: DType,
    data_start: usize,
    data_len: usize,
}

impl SafeTensorsFiles {
    pub fn open(paths: &[PathBuf]) -> Result<Self> {
        let mut mmaps = Vec::with_capacity(paths.len());
        let mut tensors: HashMap<String, TensorMeta> = HashMap::new();

        for (file_idx, path) in paths.iter().enumerate() {
            let file = File::open(path)?;
            // SAFETY: the files are treated as immutable for the lifetime of the map.
            let mmap = unsafe { Mmap::map(&file)? };

            let st = SafeTensors::deserialize(&mmap)?;
            for (name, tensor) in st.tensors() {
                let dtype = DType::from_safetensors(tensor.dtype()).ok_or_else(|| {
                    Error::UnsupportedDtype(format!("{:?} for tensor {name}", tensor.dtype()))
                })?;
                let data = tensor.data();
                let meta = TensorMeta {
                    file_idx,
                    shape: tensor.shape().to_vec(),
                    dtype,
                    data_start: data.as_ptr() as usize - mmap.as_ptr() as usize,
                    data_len: data.len(),
                };
                if let Some(existing) = tensors.get(&name) {
                    warn!(
                        tensor = %name,
                        kept = %paths[existing.file_idx].display(),
                        ignored = %path.display(),
                        "Tensor defined in more than one file"
                    );
                    continue;
                }
                tensors.insert(name, meta);
            }

            mmaps.push(mmap);
        }

        Ok(Self { mmaps, tensors })
    }

    pub fn meta(&self, name: &str) -> Result<&TensorMeta> {
        self.tensors
            .get(name)
            .ok_or_else(|| Error::MissingWeight(name.to_string()))
    }

    /// Raw little-endian bytes of a tensor, straight from the mapping.
    pub fn bytes(&self, name: &str) -> Result<(&TensorMeta, &[u8])> {
        let meta = self.meta(name)?;
        let mmap = &self.mmaps[meta.file_idx];
        Ok((meta, &mmap[meta.data_start..meta.data_start + meta.data_len]))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn num_files(&self) -> usize {
        self.mmaps.len()
    }
}

/// Write named tensors to a SafeTensors file.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn save_safetensors(path: impl AsRef<Path>, tensors: &[(&str, &Tensor)]) -> Result<()> {
    let views = tensors
        .iter()
        .map(|(name, t)| {
            TensorView::new(t.dtype().to_safetensors(), t.shape().to_vec(), t.as_bytes())
                .map(|view| ((*name).to_string(), view))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    safetensors::serialize_to_file(views, &None, path.as_ref())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_then_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let a = Tensor::from_f32(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = Tensor::from_i32(&[3], &[-1, 0, 7]);
        save_safetensors(&path, &[("a", &a), ("b", &b)]).unwrap();

        let files = SafeTensorsFiles::open(&[path]).unwrap();
        assert_eq!(files.num_files(), 1);
        let (meta, bytes) = files.bytes("b").unwrap();
        assert_eq!(meta.dtype, DType::I32);
        assert_eq!(meta.shape, vec![3]);
        assert_eq!(bytes, b.as_bytes());
        assert!(matches!(files.meta("c"), Err(Error::MissingWeight(_))));
    }

    #[test]
    fn test_first_file_wins_on_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("1.safetensors");
        let second = dir.path().join("2.safetensors");
        save_safetensors(&first, &[("w", &Tensor::from_f32(&[1], &[1.0]))]).unwrap();
        save_safetensors(&second, &[("w", &Tensor::from_f32(&[1], &[2.0]))]).unwrap();

        let files = SafeTensorsFiles::open(&[first, second]).unwrap();
        let (_, bytes) = files.bytes("w").unwrap();
        assert_eq!(bytes, Tensor::from_f32(&[1], &[1.0]).as_bytes());
    }
}

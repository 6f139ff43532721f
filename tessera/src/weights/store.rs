//! Named, shard-addressable weight access for one rank

use std::path::PathBuf;

use tracing::{debug, info};

use super::quantization::{
    GptqParams, GroupQuantized, LinearWeight, PackedQuantized, QuantizationBinding, Quantize,
};
use super::safetensors::SafeTensorsFiles;
use crate::device::DeviceSpec;
use crate::distributed::ProcessGroup;
use crate::dtype::DType;
use crate::shard::{ShardConfig, ShardStrategy};
use crate::tensor::{narrow_bytes, Tensor};
use crate::{hub, Error, Result};

/// Weights of one checkpoint as seen by one rank.
///
/// Floating point tensors come back in the store's dtype; integer tensors
/// (packed quantized values, group indices) come back verbatim. Sharded
/// reads return only this rank's contiguous slice, so the slices of all
/// ranks concatenate to the full tensor.
pub struct WeightStore {
    files: SafeTensorsFiles,
    spec: DeviceSpec,
    group: ProcessGroup,
    quantization: Option<QuantizationBinding>,
}

impl WeightStore {
    /// Map `paths` and index every tensor they contain.
    ///
    /// # Errors
    /// Returns an error if a file cannot be mapped or is not valid SafeTensors.
    pub fn open(paths: &[PathBuf], spec: DeviceSpec, group: ProcessGroup) -> Result<Self> {
        let files = SafeTensorsFiles::open(paths)?;
        info!(
            rank = group.rank(),
            files = files.num_files(),
            device = %spec,
            "Opened weight store"
        );
        Ok(Self {
            files,
            spec,
            group,
            quantization: None,
        })
    }

    /// Open another set of files with the same device, dtype and group.
    ///
    /// The new store starts without quantization.
    ///
    /// # Errors
    /// Returns an error if a file cannot be mapped or parsed.
    pub fn sibling(&self, paths: &[PathBuf]) -> Result<Self> {
        Self::open(paths, self.spec, self.group.clone())
    }

    #[must_use]
    pub fn device_spec(&self) -> DeviceSpec {
        self.spec
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.spec.dtype
    }

    #[must_use]
    pub fn process_group(&self) -> &ProcessGroup {
        &self.group
    }

    #[must_use]
    pub fn shard_config(&self) -> ShardConfig {
        self.group.shard_config()
    }

    #[must_use]
    pub fn quantization(&self) -> Option<&QuantizationBinding> {
        self.quantization.as_ref()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.files.contains(name)
    }

    /// Shape of the full (unsharded) tensor.
    ///
    /// # Errors
    /// Returns [`Error::MissingWeight`] if no file defines `name`.
    pub fn shape(&self, name: &str) -> Result<Vec<usize>> {
        Ok(self.files.meta(name)?.shape.clone())
    }

    /// All tensor names, sorted.
    #[must_use]
    pub fn tensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.names().map(str::to_string).collect();
        names.sort();
        names
    }

    /// Full tensor.
    ///
    /// # Errors
    /// Returns [`Error::MissingWeight`] if no file defines `name`.
    pub fn get(&self, name: &str) -> Result<Tensor> {
        let (meta, bytes) = self.files.bytes(name)?;
        let tensor = Tensor::from_raw(&meta.shape, meta.dtype, bytes.to_vec());
        self.cast(tensor)
    }

    /// This rank's contiguous slice of `name` along `dim`.
    ///
    /// # Errors
    /// Returns [`Error::MissingWeight`] if no file defines `name`,
    /// [`Error::ShapeMismatch`] if `dim` is out of range and
    /// [`Error::ShardAlignment`] if the dimension does not divide evenly.
    pub fn get_sharded(&self, name: &str, dim: usize) -> Result<Tensor> {
        let (meta, bytes) = self.files.bytes(name)?;
        if dim >= meta.shape.len() {
            return Err(Error::shape_mismatch(
                format!("{name} sharded along dim {dim}"),
                &[dim + 1],
                &meta.shape,
            ));
        }
        let (start, len) = self
            .shard_config()
            .shard_range(name, dim, meta.shape[dim])?;
        let slice = narrow_bytes(bytes, &meta.shape, meta.dtype, dim, start, len);
        let mut shape = meta.shape.clone();
        shape[dim] = len;
        self.cast(Tensor::from_raw(&shape, meta.dtype, slice))
    }

    /// Load `name` as `strategy` prescribes for an `(out, in)` weight.
    ///
    /// One-dimensional tensors (biases) follow `Column` along their only
    /// dimension and are replicated under `Row`.
    ///
    /// # Errors
    /// Same as [`Self::get`] and [`Self::get_sharded`].
    pub fn get_with_strategy(&self, name: &str, strategy: ShardStrategy) -> Result<Tensor> {
        match strategy.dim() {
            None => self.get(name),
            Some(dim) => {
                if dim > 0 && self.shape(name)?.len() == 1 {
                    self.get(name)
                } else {
                    self.get_sharded(name, dim)
                }
            }
        }
    }

    /// Attach quantization parameters for `mode`.
    ///
    /// Parameters come from the `gptq_bits`/`gptq_groupsize` tensors when the
    /// checkpoint carries them, otherwise from the model's `config.json` or
    /// `quantize_config.json`. A `None` mode leaves the store unquantized.
    ///
    /// # Errors
    /// Returns [`Error::Quantization`] if no parameters can be found or they
    /// are unusable in `mode`, and [`Error::ModelNotFound`] if `model_id`
    /// does not resolve.
    pub fn bind_quantization(
        &mut self,
        model_id: &str,
        revision: Option<&str>,
        mode: Option<Quantize>,
    ) -> Result<()> {
        let Some(mode) = mode else {
            return Ok(());
        };
        let params = match self.params_from_tensors()? {
            Some(params) => params,
            None => {
                let dir = hub::resolve_model_dir(model_id, revision)?;
                GptqParams::from_model_dir(&dir)?.ok_or_else(|| {
                    Error::Quantization(format!(
                        "{model_id} has no GPTQ parameters (no gptq_bits tensor, \
                         quantization_config or quantize_config.json)"
                    ))
                })?
            }
        };
        params.validate(mode)?;
        info!(
            %mode,
            bits = params.bits,
            group_size = params.group_size,
            desc_act = params.desc_act,
            "Bound quantization parameters"
        );
        self.quantization = Some(QuantizationBinding { mode, params });
        Ok(())
    }

    fn params_from_tensors(&self) -> Result<Option<GptqParams>> {
        if !(self.contains("gptq_bits") && self.contains("gptq_groupsize")) {
            return Ok(None);
        }
        let scalar = |name: &str| -> Result<i64> {
            let t = self.get(name)?;
            if t.numel() == 0 {
                return Err(Error::Quantization(format!("{name} is empty")));
            }
            match t.dtype() {
                DType::I32 => Ok(i64::from(t.as_i32_slice()[0])),
                DType::U32 => Ok(i64::from(t.as_u32_slice()[0])),
                other => Err(Error::Quantization(format!("{name} has dtype {other}"))),
            }
        };
        let bits = u32::try_from(scalar("gptq_bits")?)
            .map_err(|_| Error::Quantization("negative gptq_bits".into()))?;
        let group_size = usize::try_from(scalar("gptq_groupsize")?).unwrap_or(0);
        Ok(Some(GptqParams {
            bits,
            group_size,
            desc_act: false,
            sym: true,
        }))
    }

    /// Load the linear layer at `prefix` (`{prefix}.weight`, or
    /// `{prefix}.qweight` and friends once quantization is bound).
    ///
    /// # Errors
    /// Returns [`Error::MissingWeight`] for absent components and
    /// [`Error::ShardAlignment`] for indivisible shards.
    pub fn get_linear(&self, prefix: &str, strategy: ShardStrategy) -> Result<LinearWeight> {
        let Some(binding) = self.quantization else {
            let weight = self.get_with_strategy(&format!("{prefix}.weight"), strategy)?;
            return Ok(LinearWeight::Unquantized(weight));
        };
        let params = binding.params;
        let name = |suffix: &str| format!("{prefix}.{suffix}");

        // qweight/scales/qzeros are stored input-major: (in, out).
        let (qweight, scales, qzeros, g_idx) = match strategy {
            ShardStrategy::Replicate => (
                self.get(&name("qweight"))?,
                self.get(&name("scales"))?,
                self.get_optional(&name("qzeros"))?,
                self.get_optional(&name("g_idx"))?,
            ),
            ShardStrategy::Column => (
                self.get_sharded(&name("qweight"), 1)?,
                self.get_sharded(&name("scales"), 1)?,
                self.optional(&name("qzeros"), |n| self.get_sharded(n, 1))?,
                self.get_optional(&name("g_idx"))?,
            ),
            ShardStrategy::Row => {
                let sequential = params.group_size > 0 && !params.desc_act;
                let qweight = self.get_sharded(&name("qweight"), 0)?;
                let g_idx = self.optional(&name("g_idx"), |n| self.get_sharded(n, 0))?;
                if sequential {
                    let scales = self.get_sharded(&name("scales"), 0)?;
                    let qzeros = self.optional(&name("qzeros"), |n| self.get_sharded(n, 0))?;
                    // Group indices are global; make them relative to this shard.
                    let offset = self.shard_config().rank * scales.shape()[0];
                    let g_idx = g_idx.map(|g| rebase_groups(&g, offset));
                    (qweight, scales, qzeros, g_idx)
                } else {
                    (
                        qweight,
                        self.get(&name("scales"))?,
                        self.get_optional(&name("qzeros"))?,
                        g_idx,
                    )
                }
            }
        };

        debug!(prefix, ?strategy, mode = %binding.mode, "Loaded quantized linear");
        match binding.mode {
            Quantize::Gptq => {
                let in_features = qweight.shape()[0] * params.pack_factor();
                let g_idx = match g_idx {
                    Some(g) => g,
                    None => sequential_groups(in_features, params.group_size),
                };
                let qzeros = qzeros.ok_or_else(|| Error::MissingWeight(name("qzeros")))?;
                Ok(LinearWeight::GroupQuantized(GroupQuantized {
                    qweight,
                    qzeros,
                    scales,
                    g_idx,
                    bits: params.bits,
                    group_size: params.group_size,
                }))
            }
            Quantize::Marlin => Ok(LinearWeight::PackedQuantized(PackedQuantized {
                qweight,
                scales,
                bits: params.bits,
                group_size: params.group_size,
            })),
        }
    }

    fn get_optional(&self, name: &str) -> Result<Option<Tensor>> {
        self.optional(name, |n| self.get(n))
    }

    fn optional(
        &self,
        name: &str,
        load: impl FnOnce(&str) -> Result<Tensor>,
    ) -> Result<Option<Tensor>> {
        if self.contains(name) {
            load(name).map(Some)
        } else {
            Ok(None)
        }
    }

    fn cast(&self, tensor: Tensor) -> Result<Tensor> {
        if tensor.dtype().is_float() {
            tensor.to_dtype(self.spec.dtype)
        } else {
            Ok(tensor)
        }
    }
}

fn rebase_groups(g_idx: &Tensor, offset: usize) -> Tensor {
    let offset = offset as i32;
    let rebased: Vec<i32> = g_idx.as_i32_slice().iter().map(|g| g - offset).collect();
    Tensor::from_i32(g_idx.shape(), &rebased)
}

fn sequential_groups(in_features: usize, group_size: usize) -> Tensor {
    let group_size = if group_size == 0 {
        in_features
    } else {
        group_size
    };
    let g_idx: Vec<i32> = (0..in_features).map(|r| (r / group_size) as i32).collect();
    Tensor::from_i32(&[in_features], &g_idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::save_safetensors;

    fn write(dir: &std::path::Path, file: &str, tensors: &[(&str, &Tensor)]) -> PathBuf {
        let path = dir.join(file);
        save_safetensors(&path, tensors).unwrap();
        path
    }

    #[test]
    fn test_get_resolves_across_files_and_casts() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(
            dir.path(),
            "a.safetensors",
            &[("x", &Tensor::from_f32(&[2], &[1.5, -2.0]))],
        );
        let b = write(
            dir.path(),
            "b.safetensors",
            &[("ids", &Tensor::from_i32(&[2], &[3, 4]))],
        );
        let spec = DeviceSpec {
            dtype: DType::F16,
            ..DeviceSpec::HOST_F32
        };
        let store = WeightStore::open(&[a, b], spec, ProcessGroup::single()).unwrap();

        let x = store.get("x").unwrap();
        assert_eq!(x.dtype(), DType::F16);
        assert_eq!(x.to_f32_vec(), vec![1.5, -2.0]);
        // Integer tensors are never cast.
        assert_eq!(store.get("ids").unwrap().dtype(), DType::I32);
        assert!(matches!(store.get("y"), Err(Error::MissingWeight(_))));
        assert_eq!(store.tensor_names(), vec!["ids".to_string(), "x".to_string()]);
    }

    #[test]
    fn test_get_with_strategy_row_bias_is_replicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "w.safetensors",
            &[("bias", &Tensor::from_f32(&[3], &[1.0, 2.0, 3.0]))],
        );
        let groups = ProcessGroup::local(3);
        let store = WeightStore::open(&[path], DeviceSpec::HOST_F32, groups[1].clone()).unwrap();
        assert_eq!(
            store.get_with_strategy("bias", ShardStrategy::Row).unwrap().shape(),
            &[3]
        );
        assert_eq!(
            store
                .get_with_strategy("bias", ShardStrategy::Column)
                .unwrap()
                .as_f32_slice(),
            &[2.0]
        );
    }

    #[test]
    fn test_get_sharded_dim_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "w.safetensors",
            &[("v", &Tensor::from_f32(&[4], &[0.0; 4]))],
        );
        let store = WeightStore::open(&[path], DeviceSpec::HOST_F32, ProcessGroup::single()).unwrap();
        assert!(matches!(
            store.get_sharded("v", 1),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_bind_quantization_none_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "w.safetensors",
            &[("v", &Tensor::from_f32(&[1], &[0.0]))],
        );
        let mut store =
            WeightStore::open(&[path], DeviceSpec::HOST_F32, ProcessGroup::single()).unwrap();
        // The model id is never resolved when no mode is requested.
        store.bind_quantization("does/not-exist", None, None).unwrap();
        assert!(store.quantization().is_none());
    }

    #[test]
    fn test_bind_quantization_from_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "w.safetensors",
            &[
                ("gptq_bits", &Tensor::from_i32(&[1], &[4])),
                ("gptq_groupsize", &Tensor::from_i32(&[1], &[-1])),
            ],
        );
        let mut store =
            WeightStore::open(&[path], DeviceSpec::HOST_F32, ProcessGroup::single()).unwrap();
        store
            .bind_quantization("does/not-exist", None, Some(Quantize::Marlin))
            .unwrap();
        let binding = store.quantization().unwrap();
        assert_eq!(binding.mode, Quantize::Marlin);
        assert_eq!(binding.params.bits, 4);
        assert_eq!(binding.params.group_size, 0);
    }

    #[test]
    fn test_bind_quantization_rejects_empty_scalar() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "w.safetensors",
            &[
                ("gptq_bits", &Tensor::from_i32(&[0], &[])),
                ("gptq_groupsize", &Tensor::from_i32(&[1], &[128])),
            ],
        );
        let mut store =
            WeightStore::open(&[path], DeviceSpec::HOST_F32, ProcessGroup::single()).unwrap();
        match store.bind_quantization("does/not-exist", None, Some(Quantize::Gptq)) {
            Err(Error::Quantization(msg)) => assert!(msg.contains("gptq_bits is empty")),
            other => panic!("expected a quantization error, got {other:?}"),
        }
        assert!(store.quantization().is_none());
    }

    #[test]
    fn test_bind_quantization_without_params_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "w.safetensors",
            &[("v", &Tensor::from_f32(&[1], &[0.0]))],
        );
        let mut store =
            WeightStore::open(&[path], DeviceSpec::HOST_F32, ProcessGroup::single()).unwrap();
        let model_id = dir.path().to_str().unwrap();
        assert!(matches!(
            store.bind_quantization(model_id, None, Some(Quantize::Gptq)),
            Err(Error::Quantization(_))
        ));
    }
}

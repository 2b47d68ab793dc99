//! Pretrained weight import and fine-tuned checkpoints.
//!
//! ## Pretrained import
//!
//! HuggingFace checkpoints differ from the in-memory layout in a few ways,
//! all handled here:
//!
//! - names may carry a `bert.` / `deberta.` prefix, and older files call
//!   LayerNorm parameters `gamma` / `beta`
//! - `nn.Linear` stores weights as `[out, in]`; [`TrainableLinear`] keeps `[in, out]`
//! - DeBERTa packs Q, K and V into one `in_proj` whose output rows are
//!   interleaved per head (`q_h, k_h, v_h` for each head `h`), with separate
//!   `q_bias` / `v_bias` vectors and no key bias
//! - tensors may be F32, F16 or BF16
//!
//! Tensors the encoder has no use for (pooler, MLM heads, `position_ids`)
//! are reported at debug level and skipped.
//!
//! ## Checkpoints
//!
//! A fine-tuned classifier is saved as a directory:
//!
//! ```text
//! model.safetensors   every parameter under its internal name, F32
//! metadata.json       encoder config, head config, run metrics
//! ```
//!
//! [`TrainableLinear`]: crate::layers::TrainableLinear

use crate::classifier::{BertClassifier, ClassifierConfig};
use crate::encoder::{EncoderConfig, TrainableEncoder};
use crate::error::{FinetuneError, Result};
use crate::gradients::Trainable;
use crate::tensor::Tensor;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

pub const CHECKPOINT_WEIGHTS: &str = "model.safetensors";
pub const CHECKPOINT_METADATA: &str = "metadata.json";
pub const CHECKPOINT_VERSION: u32 = 1;

const MODEL_PREFIXES: [&str; 2] = ["bert.", "deberta."];

/// Decode one safetensors view into f32 values.
fn to_f32(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>> {
    let bytes = view.data();
    let values = match view.dtype() {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        other => {
            return Err(FinetuneError::Weights(format!(
                "{}: unsupported dtype {:?}",
                name, other
            )))
        }
    };
    Ok(values)
}

/// Strip the model prefix and rename legacy LayerNorm parameters.
fn normalize_name(raw: &str) -> String {
    let mut name = raw;
    for prefix in MODEL_PREFIXES {
        if let Some(rest) = name.strip_prefix(prefix) {
            name = rest;
            break;
        }
    }
    if name.contains("LayerNorm") {
        if let Some(base) = name.strip_suffix(".gamma") {
            return format!("{}.weight", base);
        }
        if let Some(base) = name.strip_suffix(".beta") {
            return format!("{}.bias", base);
        }
    }
    name.to_string()
}

/// Linear weights are the only tensors stored transposed.
fn is_linear_weight(name: &str) -> bool {
    name.ends_with(".weight") && !name.contains("LayerNorm") && !name.contains("embeddings")
}

/// Split DeBERTa's `in_proj.weight` (`[3·hidden, hidden]`, HF layout) into
/// query/key/value weights, each `[hidden, hidden]` in HF layout.
pub fn split_in_proj(weight: &Tensor, num_heads: usize) -> Result<[Tensor; 3]> {
    let hidden = weight.cols();
    if weight.shape.len() != 2 || weight.rows() != 3 * hidden || hidden % num_heads != 0 {
        return Err(FinetuneError::Weights(format!(
            "in_proj.weight has shape {:?}, expected [3·hidden, hidden] with {} heads",
            weight.shape, num_heads
        )));
    }
    let head_dim = hidden / num_heads;
    let mut parts = [Vec::new(), Vec::new(), Vec::new()];
    for h in 0..num_heads {
        for (which, part) in parts.iter_mut().enumerate() {
            let start = (h * 3 + which) * head_dim;
            part.extend_from_slice(&weight.data[start * hidden..(start + head_dim) * hidden]);
        }
    }
    let [q, k, v] = parts;
    Ok([
        Tensor::new(q, vec![hidden, hidden]),
        Tensor::new(k, vec![hidden, hidden]),
        Tensor::new(v, vec![hidden, hidden]),
    ])
}

/// Read every tensor of a pretrained checkpoint under internal names and layout.
fn read_pretrained(bytes: &[u8], config: &EncoderConfig) -> Result<HashMap<String, Tensor>> {
    let st = SafeTensors::deserialize(bytes)?;
    let mut tensors = HashMap::new();

    for (raw_name, view) in st.tensors() {
        let name = normalize_name(&raw_name);
        if !matches!(view.dtype(), Dtype::F32 | Dtype::F16 | Dtype::BF16) {
            log::debug!("Skipping non-float tensor {} ({:?})", raw_name, view.dtype());
            continue;
        }
        let tensor = Tensor::new(to_f32(&raw_name, &view)?, view.shape().to_vec());

        if let Some(layer) = name.strip_suffix(".attention.self.in_proj.weight") {
            let [q, k, v] = split_in_proj(&tensor, config.num_attention_heads)?;
            let base = format!("{}.attention.self", layer);
            tensors.insert(format!("{}.query_proj.weight", base), q.transpose());
            tensors.insert(format!("{}.key_proj.weight", base), k.transpose());
            tensors.insert(format!("{}.value_proj.weight", base), v.transpose());
        } else if let Some(base) = name.strip_suffix(".q_bias") {
            tensors.insert(format!("{}.query_proj.bias", base), tensor);
        } else if let Some(base) = name.strip_suffix(".v_bias") {
            tensors.insert(format!("{}.value_proj.bias", base), tensor);
        } else if is_linear_weight(&name) && tensor.shape.len() == 2 {
            tensors.insert(name, tensor.transpose());
        } else {
            tensors.insert(name, tensor);
        }
    }
    Ok(tensors)
}

/// Copy named tensors into `model`; every model parameter must be present
/// with a matching shape. Returns the names that were not used.
fn assign_parameters<M: Trainable + ?Sized>(
    model: &mut M,
    mut tensors: HashMap<String, Tensor>,
    source: &Path,
) -> Result<Vec<String>> {
    let mut error = None;
    let mut assigned = 0usize;
    model.visit_parameters_mut(&mut |name, param| {
        if error.is_some() {
            return;
        }
        match tensors.remove(name) {
            None => {
                error = Some(FinetuneError::Weights(format!(
                    "{} has no tensor for {}",
                    source.display(),
                    name
                )))
            }
            Some(t) if t.shape != param.shape => {
                error = Some(FinetuneError::Weights(format!(
                    "{}: shape {:?} in {} does not match model shape {:?}",
                    name,
                    t.shape,
                    source.display(),
                    param.shape
                )))
            }
            Some(t) => {
                param.data = t.data;
                assigned += 1;
            }
        }
    });
    if let Some(e) = error {
        return Err(e);
    }
    log::debug!("Assigned {} tensors from {}", assigned, source.display());

    let mut unused: Vec<String> = tensors.into_keys().collect();
    unused.sort();
    Ok(unused)
}

/// Load HuggingFace `model.safetensors` weights into `encoder`.
pub fn load_pretrained(encoder: &mut TrainableEncoder, path: &Path) -> Result<()> {
    let bytes = fs::read(path)?;
    let tensors = read_pretrained(&bytes, &encoder.config)?;
    let unused = assign_parameters(encoder, tensors, path)?;
    for name in &unused {
        log::debug!("Unused pretrained tensor {}", name);
    }
    log::info!(
        "Loaded {} pretrained parameters from {} ({} tensors unused)",
        encoder.num_parameters(),
        path.display(),
        unused.len()
    );
    Ok(())
}

/// Contents of `metadata.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub version: u32,
    pub encoder: EncoderConfig,
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl CheckpointMetadata {
    pub fn new(model: &BertClassifier, metrics: BTreeMap<String, f64>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            encoder: model.encoder.config.clone(),
            classifier: model.config.clone(),
            metrics,
        }
    }
}

/// Serialize named F32 tensors to a safetensors file.
fn write_safetensors(path: &Path, tensors: &[(String, Tensor)]) -> Result<()> {
    let views = tensors
        .iter()
        .map(|(name, t)| {
            TensorView::new(Dtype::F32, t.shape.clone(), bytemuck::cast_slice(&t.data))
                .map(|view| (name.as_str(), view))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut st_metadata = HashMap::new();
    st_metadata.insert("format".to_string(), "cora-finetune".to_string());
    let bytes = safetensors::serialize(views, &Some(st_metadata))?;
    fs::write(path, bytes)?;
    Ok(())
}

/// Write `encoder` as a HuggingFace-style `model.safetensors`
/// (`[out, in]` Linear weights, separate query/key/value projections).
///
/// The result loads back through [`load_pretrained`], which makes it a
/// portable starting point for later fine-tuning.
pub fn export_pretrained(encoder: &TrainableEncoder, path: &Path) -> Result<()> {
    let mut tensors = Vec::new();
    encoder.visit_parameters(&mut |name, t| {
        let t = if is_linear_weight(name) { t.transpose() } else { t.clone() };
        tensors.push((name.to_string(), t));
    });
    write_safetensors(path, &tensors)?;
    log::info!("Exported {} tensors to {}", tensors.len(), path.display());
    Ok(())
}

/// Write `model.safetensors` and `metadata.json` into `dir` (created if needed).
pub fn save_checkpoint(dir: &Path, model: &BertClassifier, metrics: BTreeMap<String, f64>) -> Result<()> {
    fs::create_dir_all(dir)?;

    let mut tensors = Vec::new();
    model.visit_parameters(&mut |name, t| tensors.push((name.to_string(), t.clone())));
    write_safetensors(&dir.join(CHECKPOINT_WEIGHTS), &tensors)?;

    let metadata = CheckpointMetadata::new(model, metrics);
    fs::write(
        dir.join(CHECKPOINT_METADATA),
        serde_json::to_string_pretty(&metadata)?,
    )?;
    log::info!("Saved checkpoint to {}", dir.display());
    Ok(())
}

/// Rebuild a classifier saved by [`save_checkpoint`].
pub fn load_checkpoint(dir: &Path) -> Result<(BertClassifier, CheckpointMetadata)> {
    let metadata: CheckpointMetadata =
        serde_json::from_str(&fs::read_to_string(dir.join(CHECKPOINT_METADATA))?)?;
    if metadata.version != CHECKPOINT_VERSION {
        return Err(FinetuneError::Weights(format!(
            "checkpoint version {} is not supported (expected {})",
            metadata.version, CHECKPOINT_VERSION
        )));
    }

    let encoder = TrainableEncoder::new(&metadata.encoder, 0)?;
    let mut model = BertClassifier::new(encoder, metadata.classifier.clone(), 0);

    let path = dir.join(CHECKPOINT_WEIGHTS);
    let bytes = fs::read(&path)?;
    let st = SafeTensors::deserialize(&bytes)?;
    let tensors = st
        .tensors()
        .into_iter()
        .map(|(name, view)| {
            let data = to_f32(&name, &view)?;
            Ok((name, Tensor::new(data, view.shape().to_vec())))
        })
        .collect::<Result<HashMap<_, _>>>()?;

    let names: HashSet<String> = tensors.keys().cloned().collect();
    let unused = assign_parameters(&mut model, tensors, &path)?;
    if !unused.is_empty() {
        log::warn!(
            "{} of {} checkpoint tensors were not used: {:?}",
            unused.len(),
            names.len(),
            unused
        );
    }
    Ok((model, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        bytemuck::cast_slice(values).to_vec()
    }

    /// Serialize `(hf_name, shape, values)` triples as an F32 safetensors file.
    fn write_hf_file(path: &Path, tensors: &[(String, Vec<usize>, Vec<f32>)]) {
        let bytes: Vec<(String, Vec<u8>, Vec<usize>)> = tensors
            .iter()
            .map(|(n, s, v)| (n.clone(), f32_bytes(v), s.clone()))
            .collect();
        let views: Vec<(&str, TensorView<'_>)> = bytes
            .iter()
            .map(|(n, b, s)| (n.as_str(), TensorView::new(Dtype::F32, s.clone(), b).unwrap()))
            .collect();
        fs::write(path, safetensors::serialize(views, &None).unwrap()).unwrap();
    }

    /// Export a model the way HF would store it: `[out, in]` Linear weights,
    /// `prefix` on every name, optional legacy LayerNorm names.
    fn export_hf(encoder: &TrainableEncoder, prefix: &str, legacy_norm: bool) -> Vec<(String, Vec<usize>, Vec<f32>)> {
        let mut out = Vec::new();
        encoder.visit_parameters(&mut |name, t| {
            let t = if is_linear_weight(name) { t.transpose() } else { t.clone() };
            let mut hf_name = format!("{}{}", prefix, name);
            if legacy_norm && name.contains("LayerNorm") {
                hf_name = hf_name.replace(".weight", ".gamma").replace(".bias", ".beta");
            }
            out.push((hf_name, t.shape.clone(), t.data));
        });
        out.push((format!("{}pooler.dense.weight", prefix), vec![2, 2], vec![0.0; 4]));
        out
    }

    fn assert_same_parameters(a: &TrainableEncoder, b: &TrainableEncoder) {
        let mut left = Vec::new();
        a.visit_parameters(&mut |n, t| left.push((n.to_string(), t.data.clone())));
        let mut i = 0;
        b.visit_parameters(&mut |n, t| {
            assert_eq!(left[i].0, n);
            assert_eq!(left[i].1, t.data, "{}", n);
            i += 1;
        });
    }

    #[test]
    fn test_bert_import_with_prefix_and_legacy_names() {
        let config = EncoderConfig::tiny_bert(16);
        let source = TrainableEncoder::new(&config, 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_hf_file(&path, &export_hf(&source, "bert.", true));

        let mut target = TrainableEncoder::new(&config, 2).unwrap();
        load_pretrained(&mut target, &path).unwrap();
        assert_same_parameters(&source, &target);
    }

    #[test]
    fn test_export_pretrained_loads_back() {
        let config = EncoderConfig::tiny_deberta(16);
        let source = TrainableEncoder::new(&config, 3).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        export_pretrained(&source, &path).unwrap();

        let bytes = fs::read(&path).unwrap();
        let st = SafeTensors::deserialize(&bytes).unwrap();
        let dense = st.tensor("encoder.layer.0.intermediate.dense.weight").unwrap();
        assert_eq!(dense.shape(), &[config.intermediate_size, config.hidden_size]);

        let mut target = TrainableEncoder::new(&config, 8).unwrap();
        load_pretrained(&mut target, &path).unwrap();
        assert_same_parameters(&source, &target);
    }

    #[test]
    fn test_missing_tensor_and_shape_mismatch_are_errors() {
        let config = EncoderConfig::tiny_bert(16);
        let source = TrainableEncoder::new(&config, 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");

        let mut tensors = export_hf(&source, "", false);
        tensors.retain(|(n, _, _)| n != "encoder.layer.1.output.dense.bias");
        write_hf_file(&path, &tensors);
        let mut target = TrainableEncoder::new(&config, 2).unwrap();
        let err = load_pretrained(&mut target, &path).unwrap_err();
        assert!(err.to_string().contains("encoder.layer.1.output.dense.bias"));

        let bigger = EncoderConfig::tiny_bert(20);
        let mut target = TrainableEncoder::new(&bigger, 2).unwrap();
        write_hf_file(&path, &export_hf(&source, "", false));
        assert!(matches!(
            load_pretrained(&mut target, &path),
            Err(FinetuneError::Weights(_))
        ));
    }

    #[test]
    fn test_split_in_proj_deinterleaves_heads() {
        // 2 heads, head_dim 1, hidden 2: rows are q0 k0 v0 q1 k1 v1
        let rows: Vec<f32> = (0..6).flat_map(|r| [r as f32, r as f32 + 0.5]).collect();
        let [q, k, v] = split_in_proj(&Tensor::new(rows, vec![6, 2]), 2).unwrap();
        assert_eq!(q.data, vec![0.0, 0.5, 3.0, 3.5]);
        assert_eq!(k.data, vec![1.0, 1.5, 4.0, 4.5]);
        assert_eq!(v.data, vec![2.0, 2.5, 5.0, 5.5]);
        assert!(split_in_proj(&Tensor::zeros(vec![5, 2]), 2).is_err());
    }

    #[test]
    fn test_deberta_import_from_in_proj_and_f16() {
        let config = EncoderConfig::tiny_deberta(16);
        let source = TrainableEncoder::new(&config, 4).unwrap();
        let heads = config.num_attention_heads;
        let dh = config.head_dim();
        let hidden = config.hidden_size;

        // Re-pack q/k/v into the interleaved HF layout, stored as F16
        let mut exported: Vec<(String, Vec<usize>, Vec<f32>)> = Vec::new();
        let mut qkv: HashMap<String, [Tensor; 3]> = HashMap::new();
        for (name, shape, data) in export_hf(&source, "deberta.", false) {
            let t = Tensor::new(data.clone(), shape.clone());
            let slot = ["query_proj.weight", "key_proj.weight", "value_proj.weight"]
                .iter()
                .position(|s| name.ends_with(s));
            if let Some(which) = slot {
                let base = name.rsplit_once('.').unwrap().0.rsplit_once('.').unwrap().0.to_string();
                let entry = qkv
                    .entry(base)
                    .or_insert_with(|| [Tensor::zeros(vec![0]), Tensor::zeros(vec![0]), Tensor::zeros(vec![0])]);
                entry[which] = t;
            } else if let Some(base) = name.strip_suffix(".query_proj.bias") {
                exported.push((format!("{}.q_bias", base), shape, data));
            } else if let Some(base) = name.strip_suffix(".value_proj.bias") {
                exported.push((format!("{}.v_bias", base), shape, data));
            } else {
                exported.push((name, shape, data));
            }
        }
        for (base, [q, k, v]) in qkv {
            let mut packed = Vec::new();
            for h in 0..heads {
                for part in [&q, &k, &v] {
                    packed.extend_from_slice(&part.data[h * dh * hidden..(h + 1) * dh * hidden]);
                }
            }
            exported.push((format!("{}.in_proj.weight", base), vec![3 * hidden, hidden], packed));
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let halves: Vec<(String, Vec<u8>, Vec<usize>)> = exported
            .iter()
            .map(|(n, s, v)| {
                let h: Vec<u8> = v
                    .iter()
                    .flat_map(|&x| half::f16::from_f32(x).to_le_bytes())
                    .collect();
                (n.clone(), h, s.clone())
            })
            .collect();
        let views: Vec<(&str, TensorView<'_>)> = halves
            .iter()
            .map(|(n, b, s)| (n.as_str(), TensorView::new(Dtype::F16, s.clone(), b).unwrap()))
            .collect();
        fs::write(&path, safetensors::serialize(views, &None).unwrap()).unwrap();

        let mut target = TrainableEncoder::new(&config, 9).unwrap();
        load_pretrained(&mut target, &path).unwrap();

        let mut expected = Vec::new();
        source.visit_parameters(&mut |n, t| expected.push((n.to_string(), t.data.clone())));
        let mut i = 0;
        target.visit_parameters(&mut |n, t| {
            assert_eq!(expected[i].0, n);
            for (a, b) in expected[i].1.iter().zip(&t.data) {
                assert_abs_diff_eq!(a, b, epsilon = 2e-3);
            }
            i += 1;
        });
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let encoder = TrainableEncoder::new(&EncoderConfig::tiny_deberta(16), 5).unwrap();
        let config = ClassifierConfig {
            feat_shrink: Some(3),
            ..ClassifierConfig::default()
        };
        let model = BertClassifier::new(encoder, config, 6);
        let dir = tempfile::tempdir().unwrap();
        let mut metrics = BTreeMap::new();
        metrics.insert("test_acc".to_string(), 0.75);
        save_checkpoint(dir.path(), &model, metrics).unwrap();

        let (restored, metadata) = load_checkpoint(dir.path()).unwrap();
        assert_eq!(metadata.classifier.feat_shrink, Some(3));
        assert_eq!(metadata.metrics["test_acc"], 0.75);
        assert_same_parameters(&model.encoder, &restored.encoder);
        assert_eq!(model.classifier.weight.data, restored.classifier.weight.data);
    }

    #[test]
    fn test_checkpoint_version_mismatch() {
        let encoder = TrainableEncoder::new(&EncoderConfig::tiny_bert(16), 5).unwrap();
        let model = BertClassifier::new(encoder, ClassifierConfig::default(), 6);
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(dir.path(), &model, BTreeMap::new()).unwrap();

        let meta_path = dir.path().join(CHECKPOINT_METADATA);
        let mut meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&meta_path).unwrap()).unwrap();
        meta["version"] = serde_json::json!(99);
        fs::write(&meta_path, meta.to_string()).unwrap();
        assert!(load_checkpoint(dir.path()).is_err());
    }
}

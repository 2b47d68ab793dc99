//! Cora citation dataset with raw paper text.
//!
//! Expected layout under the dataset root:
//!
//! ```text
//! cora_orig/cora/cora.content             paper_id <binary features...> class_label
//! cora_orig/cora/cora.cites               cited_id citing_id
//! cora_orig/mccallum/cora/papers          paper_id \t filename \t citation
//! cora_orig/mccallum/cora/extractions/<filename>
//! ```
//!
//! Node `i` is row `i` of `cora.content`. Its text is the title line and the
//! abstract line of the paper's extraction file joined by a newline.

use crate::error::{FinetuneError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Class names in label order.
pub const CORA_CLASSES: [&str; 7] = [
    "Case_Based",
    "Genetic_Algorithms",
    "Neural_Networks",
    "Probabilistic_Methods",
    "Reinforcement_Learning",
    "Rule_Learning",
    "Theory",
];

const TRAIN_FRACTION: f64 = 0.6;
const VAL_FRACTION: f64 = 0.2;

/// Papers, labels, texts and citation edges.
#[derive(Clone, Debug)]
pub struct CoraDataset {
    pub paper_ids: Vec<String>,
    pub labels: Vec<usize>,
    pub texts: Vec<String>,
    /// `(cited, citing)` node indices
    pub edges: Vec<(usize, usize)>,
}

/// Node indices of one random split, each sorted ascending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
    pub test: Vec<usize>,
}

impl CoraDataset {
    /// Load everything under `root` (the directory that contains `cora_orig/`).
    pub fn load(root: &Path) -> Result<Self> {
        let base = root.join("cora_orig");
        let content_path = base.join("cora").join("cora.content");
        let (paper_ids, labels) = read_content(&content_path)?;

        let index: HashMap<&str, usize> = paper_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let edges = read_cites(&base.join("cora").join("cora.cites"), &index)?;

        let mccallum = base.join("mccallum").join("cora");
        let filenames = read_papers(&mccallum.join("papers"))?;
        let extractions = mccallum.join("extractions");
        let texts = paper_ids
            .iter()
            .map(|id| {
                let filename = filenames.get(id).ok_or_else(|| {
                    FinetuneError::dataset(
                        mccallum.join("papers"),
                        format!("no entry for paper {}", id),
                    )
                })?;
                read_extraction(&extractions.join(filename))
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Loaded Cora from {}: {} papers, {} citation edges",
            root.display(),
            paper_ids.len(),
            edges.len()
        );

        Ok(Self {
            paper_ids,
            labels,
            texts,
            edges,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        CORA_CLASSES.len()
    }

    /// Seeded 60/20/20 split of the node indices.
    pub fn split(&self, seed: u64) -> Split {
        random_split(self.len(), seed)
    }

    pub fn labels_of(&self, indices: &[usize]) -> Vec<usize> {
        indices.iter().map(|&i| self.labels[i]).collect()
    }
}

/// Shuffle `0..n` with a seeded RNG, take 60% train, 20% val, rest test.
pub fn random_split(n: usize, seed: u64) -> Split {
    let mut ids: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    ids.shuffle(&mut rng);

    let n_train = (n as f64 * TRAIN_FRACTION) as usize;
    let n_val_end = (n as f64 * (TRAIN_FRACTION + VAL_FRACTION)) as usize;

    let sorted = |slice: &[usize]| {
        let mut v = slice.to_vec();
        v.sort_unstable();
        v
    };
    Split {
        train: sorted(&ids[..n_train]),
        val: sorted(&ids[n_train..n_val_end]),
        test: sorted(&ids[n_val_end..]),
    }
}

/// Texts for `indices`, in index order.
pub fn collect_texts(indices: &[usize], texts: &[String]) -> Vec<String> {
    indices.iter().map(|&i| texts[i].clone()).collect()
}

fn read_content(path: &Path) -> Result<(Vec<String>, Vec<usize>)> {
    let text = fs::read_to_string(path)
        .map_err(|e| FinetuneError::dataset(path, format!("cannot read: {}", e)))?;
    let class_index: HashMap<&str, usize> = CORA_CLASSES
        .iter()
        .enumerate()
        .map(|(i, &c)| (c, i))
        .collect();

    let mut ids = Vec::new();
    let mut labels = Vec::new();
    let mut columns = None;
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let expected = *columns.get_or_insert(fields.len());
        if fields.len() < 2 || fields.len() != expected {
            return Err(FinetuneError::dataset(
                path,
                format!(
                    "line {}: expected {} columns, found {}",
                    line_no + 1,
                    expected.max(2),
                    fields.len()
                ),
            ));
        }
        let label_name = fields[fields.len() - 1];
        let label = class_index.get(label_name).copied().ok_or_else(|| {
            FinetuneError::dataset(
                path,
                format!("line {}: unknown class {:?}", line_no + 1, label_name),
            )
        })?;
        ids.push(fields[0].to_string());
        labels.push(label);
    }

    if ids.is_empty() {
        return Err(FinetuneError::dataset(path, "no papers"));
    }
    Ok((ids, labels))
}

fn read_cites(path: &Path, index: &HashMap<&str, usize>) -> Result<Vec<(usize, usize)>> {
    let text = fs::read_to_string(path)
        .map_err(|e| FinetuneError::dataset(path, format!("cannot read: {}", e)))?;
    let mut edges = Vec::new();
    let mut skipped = 0usize;
    for (line_no, line) in text.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [] => continue,
            [cited, citing] => match (index.get(cited), index.get(citing)) {
                (Some(&a), Some(&b)) => edges.push((a, b)),
                _ => skipped += 1,
            },
            _ => {
                return Err(FinetuneError::dataset(
                    path,
                    format!("line {}: expected 2 columns, found {}", line_no + 1, fields.len()),
                ))
            }
        }
    }
    if skipped > 0 {
        log::warn!("Skipped {} citations with unknown paper ids in {}", skipped, path.display());
    }
    Ok(edges)
}

fn read_papers(path: &Path) -> Result<HashMap<String, PathBuf>> {
    let bytes = fs::read(path)
        .map_err(|e| FinetuneError::dataset(path, format!("cannot read: {}", e)))?;
    // The McCallum index has a few non-UTF-8 citation strings
    let text = String::from_utf8_lossy(&bytes);
    let mut map = HashMap::new();
    for line in text.lines() {
        let mut fields = line.split('\t');
        if let (Some(id), Some(filename)) = (fields.next(), fields.next()) {
            let (id, filename) = (id.trim(), filename.trim());
            if !id.is_empty() && !filename.is_empty() {
                map.entry(id.to_string())
                    .or_insert_with(|| PathBuf::from(filename));
            }
        }
    }
    Ok(map)
}

/// Title and abstract of one extraction file; a missing field is empty.
fn read_extraction(path: &Path) -> Result<String> {
    let bytes = fs::read(path)
        .map_err(|e| FinetuneError::dataset(path, format!("cannot read extraction: {}", e)))?;
    let text = String::from_utf8_lossy(&bytes);
    let mut title = "";
    let mut abstract_ = "";
    for line in text.lines() {
        if line.contains("Title:") {
            title = line;
        }
        if line.contains("Abstract:") {
            abstract_ = line;
        }
    }
    Ok(format!("{}\n{}", title, abstract_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_split_is_disjoint_cover_and_seeded() {
        let split = random_split(101, 3);
        assert_eq!(split.train.len(), 60);
        assert_eq!(split.val.len(), 20);
        assert_eq!(split.test.len(), 21);

        let all: HashSet<usize> = split
            .train
            .iter()
            .chain(&split.val)
            .chain(&split.test)
            .copied()
            .collect();
        assert_eq!(all.len(), 101);
        assert!(split.train.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(random_split(101, 3), split);
        assert_ne!(random_split(101, 4), split);
    }

    #[test]
    fn test_extraction_keeps_last_title_and_abstract() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paper");
        fs::write(
            &path,
            "URL: x\nTitle: Old\nTitle: Learning Graphs\nAuthor: A\nAbstract: We study graphs.\n",
        )
        .unwrap();
        assert_eq!(
            read_extraction(&path).unwrap(),
            "Title: Learning Graphs\nAbstract: We study graphs."
        );

        fs::write(&path, "Author: nobody\n").unwrap();
        assert_eq!(read_extraction(&path).unwrap(), "\n");
    }

    #[test]
    fn test_content_rejects_unknown_class() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cora.content");
        fs::write(&path, "1 0 1 Theory\n2 1 0 Astrology\n").unwrap();
        let err = read_content(&path).unwrap_err();
        assert!(matches!(err, FinetuneError::Dataset { .. }));
        assert!(err.to_string().contains("Astrology"));

        fs::write(&path, "1 0 1 Theory\n2 1 Theory\n").unwrap();
        assert!(read_content(&path).is_err());
    }

    #[test]
    fn test_collect_texts_in_index_order() {
        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(collect_texts(&[2, 0], &texts), vec!["c", "a"]);
    }
}

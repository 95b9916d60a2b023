use crate::error::{Mismatch, Result, RunError};
use candle_core::{Device, Tensor};
use flate2::bufread::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

pub const VOCAB_FILE: &str = "chars_vocab.json";

/// Distinct corpus characters ranked by descending frequency, with the dense index of each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    chars: Vec<char>,
    index: HashMap<char, u32>,
}

impl Vocabulary {
    pub fn from_corpus(text: &str) -> Self {
        let mut counts: Vec<(char, usize)> = Vec::new();
        let mut slot: HashMap<char, usize> = HashMap::new();
        for c in text.chars() {
            match slot.get(&c) {
                Some(&i) => counts[i].1 += 1,
                None => {
                    slot.insert(c, counts.len());
                    counts.push((c, 1));
                }
            }
        }
        // stable: equal counts keep first-occurrence order
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        Self::from_chars(counts.into_iter().map(|(c, _)| c).collect())
    }

    pub fn from_chars(chars: Vec<char>) -> Self {
        let index = chars
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as u32))
            .collect();
        Self { chars, index }
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn chars(&self) -> &[char] {
        &self.chars
    }

    pub fn index_of(&self, c: char) -> Option<u32> {
        self.index.get(&c).copied()
    }

    /// `None` if `text` holds a character outside the vocabulary.
    pub fn encode(&self, text: &str) -> Option<Vec<u32>> {
        text.chars().map(|c| self.index_of(c)).collect()
    }

    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter_map(|&i| self.chars.get(i as usize))
            .collect()
    }

    /// The char -> index table in the form stored next to checkpoints and in export packages.
    pub fn mapping(&self) -> BTreeMap<String, u32> {
        self.index
            .iter()
            .map(|(c, &i)| (c.to_string(), i))
            .collect()
    }
}

/// `(chars, vocab)` pair written to every run directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabArtifact {
    pub chars: Vec<char>,
    pub vocab: BTreeMap<String, u32>,
}

impl VocabArtifact {
    pub fn save(vocab: &Vocabulary, dir: &Path) -> Result<()> {
        let artifact = VocabArtifact {
            chars: vocab.chars.clone(),
            vocab: vocab.mapping(),
        };
        fs::write(dir.join(VOCAB_FILE), serde_json::to_string(&artifact)?)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let json = fs::read_to_string(dir.join(VOCAB_FILE))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Compares the character order and the index table separately, so a hand-edited artifact
    /// whose table disagrees with its own character list is still caught.
    pub fn mismatches(&self, current: &Vocabulary) -> Vec<Mismatch> {
        let mut out = Vec::new();
        if self.chars != current.chars {
            out.push(Mismatch::new(
                "chars",
                String::from_iter(&self.chars),
                String::from_iter(&current.chars),
            ));
        }
        let mapping = current.mapping();
        if self.vocab != mapping {
            out.push(Mismatch::new("vocab", &self.vocab, &mapping));
        }
        out
    }
}

/// Reads the whole corpus as Latin-1, so any byte sequence decodes. `.gz` files are
/// decompressed first.
pub fn read_corpus(path: &Path) -> Result<String> {
    let input_err = |source| RunError::Input {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(input_err)?;
    let mut bytes = Vec::new();
    if path.extension().is_some_and(|e| e == "gz") {
        let mut gz = GzDecoder::new(BufReader::new(file));
        gz.read_to_end(&mut bytes).map_err(input_err)?;
    } else {
        BufReader::new(file)
            .read_to_end(&mut bytes)
            .map_err(input_err)?;
    }
    Ok(bytes.into_iter().map(char::from).collect())
}

#[derive(Debug, Clone)]
pub struct EncodedCorpus {
    pub vocab: Vocabulary,
    pub tensor: Vec<u32>,
}

/// Where preprocessed corpora live between runs. Implementations decide what makes an entry
/// valid; `FileCache` trusts mere existence.
pub trait CorpusCache {
    fn lookup(&self, key: &str) -> Result<Option<EncodedCorpus>>;
    fn store(&self, key: &str, corpus: &EncodedCorpus) -> Result<()>;
}

pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn vocab_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}_vocab.json"))
    }

    fn tensor_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}_tensor.safetensors"))
    }
}

impl CorpusCache for FileCache {
    fn lookup(&self, key: &str) -> Result<Option<EncodedCorpus>> {
        let vocab_path = self.vocab_path(key);
        let tensor_path = self.tensor_path(key);
        if !(vocab_path.exists() && tensor_path.exists()) {
            return Ok(None);
        }
        let json = fs::read_to_string(&vocab_path).map_err(|source| RunError::Cache {
            path: vocab_path.clone(),
            source,
        })?;
        let chars: Vec<char> = serde_json::from_str(&json)?;
        let tensors = candle_core::safetensors::load(&tensor_path, &Device::Cpu)?;
        let tensor = match tensors.get("tensor") {
            Some(t) => t.to_vec1::<u32>()?,
            None => {
                return Err(RunError::Cache {
                    path: tensor_path,
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "no tensor named 'tensor'",
                    ),
                })
            }
        };
        Ok(Some(EncodedCorpus {
            vocab: Vocabulary::from_chars(chars),
            tensor,
        }))
    }

    fn store(&self, key: &str, corpus: &EncodedCorpus) -> Result<()> {
        let vocab_path = self.vocab_path(key);
        fs::write(&vocab_path, serde_json::to_string(corpus.vocab.chars())?).map_err(
            |source| RunError::Cache {
                path: vocab_path.clone(),
                source,
            },
        )?;
        Tensor::from_slice(&corpus.tensor, corpus.tensor.len(), &Device::Cpu)?
            .save_safetensors("tensor", self.tensor_path(key))?;
        Ok(())
    }
}

/// Returns the cached encoding of `path` when present, otherwise reads, ranks, encodes and
/// caches it.
pub fn load_corpus(path: &Path, key: &str, cache: &dyn CorpusCache) -> Result<EncodedCorpus> {
    if let Some(corpus) = cache.lookup(key)? {
        tracing::info!("loading preprocessed corpus '{key}'");
        return Ok(corpus);
    }
    tracing::info!("reading text file '{}'", path.display());
    let text = read_corpus(path)?;
    let vocab = Vocabulary::from_corpus(&text);
    let tensor = vocab.encode(&text).ok_or_else(|| RunError::Input {
        path: path.to_path_buf(),
        source: io::Error::new(
            io::ErrorKind::InvalidData,
            "character outside the ranked vocabulary",
        ),
    })?;
    let corpus = EncodedCorpus { vocab, tensor };
    if corpus.vocab.is_empty() {
        tracing::warn!("corpus '{}' is empty, not caching it", path.display());
    } else {
        cache.store(key, &corpus)?;
    }
    Ok(corpus)
}

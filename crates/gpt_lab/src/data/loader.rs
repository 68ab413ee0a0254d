//! Read-only memory-mapped token streams and batch extraction.

use std::fs::File;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use memmap2::Mmap;
use rand::Rng;

use super::meta::{DatasetMeta, TokenWidth, TRAIN_FILE, VAL_FILE};
use crate::error::{LabError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }

    /// Stable numeric tag, mixed into evaluation seeds.
    pub(crate) fn tag(&self) -> u64 {
        match self {
            Split::Train => 0,
            Split::Val => 1,
        }
    }
}

pub struct TokenStream {
    _file: File,
    mmap: Option<Mmap>, // None for an empty file
    len: usize,
    width: TokenWidth,
    path: PathBuf,
}

impl TokenStream {
    pub fn open<P: AsRef<Path>>(path: P, width: TokenWidth) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| LabError::MissingDataset {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let byte_len = file.metadata()?.len() as usize;
        if byte_len % width.bytes() != 0 {
            return Err(LabError::MissingDataset {
                path: path.to_path_buf(),
                reason: format!(
                    "file size {byte_len} is not a multiple of the token width {}",
                    width.bytes()
                ),
            });
        }

        // SAFETY: dataset files are immutable once meta.json is written;
        // the builder only ever replaces them by rename.
        let mmap = if byte_len == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file)? })
        };

        let len = byte_len / width.bytes();
        tracing::debug!("TokenStream: {:?} ({:?}, {} tokens)", path, width, len);

        Ok(Self {
            _file: file,
            mmap,
            len,
            width,
            path: path.to_path_buf(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `len` tokens starting at token offset `start`.
    pub fn window(&self, start: usize, len: usize) -> Result<Vec<u32>> {
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.len)
            .ok_or_else(|| {
                LabError::InvalidConfig(format!(
                    "window [{start}, {start}+{len}) exceeds {:?} ({} tokens)",
                    self.path, self.len
                ))
            })?;
        let Some(mmap) = &self.mmap else {
            return Ok(Vec::new());
        };
        let bytes = self.width.bytes();
        let raw = &mmap[start * bytes..end * bytes];
        let tokens = match self.width {
            TokenWidth::U16 => raw
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]) as u32)
                .collect(),
            TokenWidth::U32 => raw
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        };
        Ok(tokens)
    }

    pub fn to_vec(&self) -> Result<Vec<u32>> {
        self.window(0, self.len)
    }

    /// Fails with `DatasetTooSmall` unless at least `block_size + 1` tokens exist.
    pub fn require_block(&self, split: Split, block_size: usize) -> Result<()> {
        let min = block_size + 1;
        if self.len < min {
            return Err(LabError::DatasetTooSmall {
                split: split.name().to_string(),
                size: self.len,
                min,
                block_size,
            });
        }
        Ok(())
    }

    /// `n` window starts drawn uniformly from `[0, len - block_size - 1]`.
    pub fn sample_starts<R: Rng>(&self, rng: &mut R, n: usize, block_size: usize) -> Vec<usize> {
        let max_start = self.len.saturating_sub(block_size + 1);
        (0..n).map(|_| rng.gen_range(0..=max_start)).collect()
    }

    /// Inputs and one-token-shifted targets, both `[starts.len(), block_size]` u32.
    pub fn batch(&self, starts: &[usize], block_size: usize, device: &Device) -> Result<(Tensor, Tensor)> {
        let mut inputs = Vec::with_capacity(starts.len() * block_size);
        let mut targets = Vec::with_capacity(starts.len() * block_size);
        for &start in starts {
            let chunk = self.window(start, block_size + 1)?;
            inputs.extend_from_slice(&chunk[..block_size]);
            targets.extend_from_slice(&chunk[1..]);
        }
        let shape = (starts.len(), block_size);
        Ok((
            Tensor::from_vec(inputs, shape, device)?,
            Tensor::from_vec(targets, shape, device)?,
        ))
    }
}

/// An opened dataset directory: metadata plus read-only splits.
pub struct Dataset {
    pub dir: PathBuf,
    pub meta: DatasetMeta,
    pub train: TokenStream,
    pub val: Option<TokenStream>,
}

impl Dataset {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let meta = DatasetMeta::load(&dir)?;
        let train = TokenStream::open(dir.join(TRAIN_FILE), meta.token_width)?;
        let val = if meta.has_validation() {
            Some(TokenStream::open(dir.join(VAL_FILE), meta.token_width)?)
        } else {
            None
        };
        Ok(Self {
            dir,
            meta,
            train,
            val,
        })
    }

    pub fn split(&self, split: Split) -> Option<&TokenStream> {
        match split {
            Split::Train => Some(&self.train),
            Split::Val => self.val.as_ref(),
        }
    }

    /// Size checks performed before any training step.
    pub fn require_block(&self, block_size: usize) -> Result<()> {
        self.train.require_block(Split::Train, block_size)?;
        if let Some(val) = &self.val {
            val.require_block(Split::Val, block_size)?;
        }
        Ok(())
    }
}

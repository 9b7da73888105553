//! Binary checkpoint format of a `ValueModel`.
//!
//! All numbers are little endian:
//!
//! ```text
//! magic            4 bytes  "CLVN"
//! format version   u32
//! model version    u64
//! trained at       i64      unix seconds
//! training games   u64
//! feature set      bytes    null terminated name
//! num features     u32
//! hidden size      u32
//! hidden weights   f32 * num_features * hidden_size
//! hidden bias      f32 * hidden_size
//! output weights   f32 * hidden_size
//! output bias      f32
//! ```

use super::{LinearLayer, ModelMeta, ValueModel};
use crate::feature_set::build::build_feature_set;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File};
use std::io::{self, BufRead, Cursor, Read, Write};
use std::path::Path;
use thiserror::Error;

const MAGIC: &[u8; 4] = b"CLVN";

/// Bumped whenever the layout above changes
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] io::Error),

    #[error("not a model checkpoint (bad magic)")]
    BadMagic,

    #[error("unsupported checkpoint format version {0}")]
    UnsupportedFormat(u32),

    #[error("unknown feature set: {0}")]
    UnknownFeatureSet(String),

    #[error("checkpoint expects {found} features, feature set has {expected}")]
    ShapeMismatch { expected: usize, found: usize },
}

impl ValueModel {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let mut file = File::open(path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        Self::from_bytes(&buffer)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let mut cursor = Cursor::new(bytes);

        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(CheckpointError::BadMagic);
        }

        let format = cursor.read_u32::<LittleEndian>()?;
        if format != FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedFormat(format));
        }

        let meta = ModelMeta {
            version: cursor.read_u64::<LittleEndian>()?,
            trained_at: cursor.read_i64::<LittleEndian>()?,
            training_game_count: cursor.read_u64::<LittleEndian>()?,
        };

        let mut str_buffer = Vec::new();
        cursor.read_until(0, &mut str_buffer)?;
        str_buffer.pop(); // remove null byte
        let feature_set_str = String::from_utf8_lossy(&str_buffer).to_string();

        let feature_set = build_feature_set(&feature_set_str)
            .ok_or(CheckpointError::UnknownFeatureSet(feature_set_str))?;

        let num_features = cursor.read_u32::<LittleEndian>()? as usize;
        if num_features != feature_set.num_features() {
            return Err(CheckpointError::ShapeMismatch {
                expected: feature_set.num_features(),
                found: num_features,
            });
        }
        let hidden_size = cursor.read_u32::<LittleEndian>()? as usize;

        let hidden = read_layer(&mut cursor, num_features, hidden_size)?;
        let output = read_layer(&mut cursor, hidden_size, 1)?;

        Ok(ValueModel::from_layers(meta, feature_set, hidden, output))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + 4 * self.params());
        self.write_to(&mut out)
            .expect("writing to a Vec never fails");
        out
    }

    fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(MAGIC)?;
        out.write_u32::<LittleEndian>(FORMAT_VERSION)?;

        out.write_u64::<LittleEndian>(self.meta.version)?;
        out.write_i64::<LittleEndian>(self.meta.trained_at)?;
        out.write_u64::<LittleEndian>(self.meta.training_game_count)?;

        out.write_all(self.feature_set.name().as_bytes())?;
        out.write_u8(0)?;

        out.write_u32::<LittleEndian>(self.hidden.num_inputs as u32)?;
        out.write_u32::<LittleEndian>(self.hidden.num_outputs as u32)?;

        write_layer(out, &self.hidden)?;
        write_layer(out, &self.output)
    }

    /// Writes the checkpoint so that `path` is either the old file or the
    /// complete new one, never a partial write
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&self.to_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;

        Ok(())
    }
}

fn read_layer(
    cursor: &mut Cursor<&[u8]>,
    num_inputs: usize,
    num_outputs: usize,
) -> io::Result<LinearLayer> {
    let mut layer = LinearLayer::zeros(num_inputs, num_outputs);
    cursor.read_f32_into::<LittleEndian>(&mut layer.weight)?;
    cursor.read_f32_into::<LittleEndian>(&mut layer.bias)?;
    Ok(layer)
}

fn write_layer<W: Write>(out: &mut W, layer: &LinearLayer) -> io::Result<()> {
    for &w in layer.weight.iter().chain(layer.bias.iter()) {
        out.write_f32::<LittleEndian>(w)?;
    }
    Ok(())
}

//! Tunable detection limits.

use serde::{Deserialize, Serialize};

use crate::error::{MagicError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Param {
    /// Nesting limit of `indirect` rules.
    IndirMax,
    /// Nesting limit of `use` calls.
    NameMax,
    /// Bytes of input inspected.
    BytesMax,
    /// Bytes a `regex` rule may scan.
    RegexMax,
    /// Bytes examined when guessing a text encoding.
    EncodingMax,
}

impl Param {
    pub const ALL: [Param; 5] = [
        Self::IndirMax,
        Self::NameMax,
        Self::BytesMax,
        Self::RegexMax,
        Self::EncodingMax,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::IndirMax => "indir_max",
            Self::NameMax => "name_max",
            Self::BytesMax => "bytes_max",
            Self::RegexMax => "regex_max",
            Self::EncodingMax => "encoding_max",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    pub indir_max: usize,
    pub name_max: usize,
    pub bytes_max: usize,
    pub regex_max: usize,
    pub encoding_max: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            indir_max: 15,
            name_max: 30,
            bytes_max: 1024 * 1024,
            regex_max: 8192,
            encoding_max: 65536,
        }
    }
}

impl Params {
    pub fn get(&self, param: Param) -> usize {
        match param {
            Param::IndirMax => self.indir_max,
            Param::NameMax => self.name_max,
            Param::BytesMax => self.bytes_max,
            Param::RegexMax => self.regex_max,
            Param::EncodingMax => self.encoding_max,
        }
    }

    /// Update one limit. Byte windows must be non-zero.
    pub fn set(&mut self, param: Param, value: usize) -> Result<()> {
        let byte_window = matches!(
            param,
            Param::BytesMax | Param::RegexMax | Param::EncodingMax
        );
        if byte_window && value == 0 {
            return Err(MagicError::InvalidParam {
                name: param.name(),
                value,
            });
        }
        let slot = match param {
            Param::IndirMax => &mut self.indir_max,
            Param::NameMax => &mut self.name_max,
            Param::BytesMax => &mut self.bytes_max,
            Param::RegexMax => &mut self.regex_max,
            Param::EncodingMax => &mut self.encoding_max,
        };
        *slot = value;
        Ok(())
    }
}

//! Storage mode flags.
//!
//! A bag of letters controls which derived data families the node keeps:
//! `h` history indexes, `r` receipts, `t` the transaction lookup index,
//! `c` call traces, `e` TEVM translations. Order-insensitive; unknown
//! letters fail parsing. The flags persist in the `DbInfo` bucket.

use std::fmt;
use std::str::FromStr;

use crate::buckets::DB_INFO;
use crate::error::{Error, Result};
use crate::kv::{RwTx, Tx};

const KEY_HISTORY: &str = "smHistory";
const KEY_RECEIPTS: &str = "smReceipts";
const KEY_TX_INDEX: &str = "smTxIndex";
const KEY_CALL_TRACES: &str = "smCallTraces";
const KEY_TEVM: &str = "smTEVM";

/// Which derived data families the database maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageMode {
    /// Keep account/storage history indexes.
    pub history: bool,
    /// Keep per-block receipts.
    pub receipts: bool,
    /// Keep the transaction hash lookup index.
    pub tx_index: bool,
    /// Keep call trace indexes.
    pub call_traces: bool,
    /// Keep TEVM translated code.
    pub tevm: bool,
}

impl FromStr for StorageMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut mode = StorageMode::default();
        for flag in s.chars() {
            match flag {
                'h' => mode.history = true,
                'r' => mode.receipts = true,
                't' => mode.tx_index = true,
                'c' => mode.call_traces = true,
                'e' => mode.tevm = true,
                _ => return Err(Error::InvalidStorageMode { flag }),
            }
        }
        Ok(mode)
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (set, letter) in [
            (self.history, 'h'),
            (self.receipts, 'r'),
            (self.tx_index, 't'),
            (self.call_traces, 'c'),
            (self.tevm, 'e'),
        ] {
            if set {
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}

impl StorageMode {
    /// Read the persisted mode. Missing keys default to off.
    pub fn read(tx: &dyn Tx) -> Result<Self> {
        Ok(Self {
            history: read_flag(tx, KEY_HISTORY)?,
            receipts: read_flag(tx, KEY_RECEIPTS)?,
            tx_index: read_flag(tx, KEY_TX_INDEX)?,
            call_traces: read_flag(tx, KEY_CALL_TRACES)?,
            tevm: read_flag(tx, KEY_TEVM)?,
        })
    }

    /// Persist the mode, overwriting all five flags.
    pub fn write(self, tx: &dyn RwTx) -> Result<()> {
        write_flag(tx, KEY_HISTORY, self.history)?;
        write_flag(tx, KEY_RECEIPTS, self.receipts)?;
        write_flag(tx, KEY_TX_INDEX, self.tx_index)?;
        write_flag(tx, KEY_CALL_TRACES, self.call_traces)?;
        write_flag(tx, KEY_TEVM, self.tevm)
    }
}

fn read_flag(tx: &dyn Tx, key: &'static str) -> Result<bool> {
    match tx.get(DB_INFO, key.as_bytes())? {
        None => Ok(false),
        Some(v) if v == [0] => Ok(false),
        Some(v) if v == [1] => Ok(true),
        Some(_) => Err(Error::CorruptedStorageMode { key }),
    }
}

fn write_flag(tx: &dyn RwTx, key: &'static str, set: bool) -> Result<()> {
    tx.put(DB_INFO, key.as_bytes(), &[u8::from(set)])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::kv::KvStoreExt;
    use crate::mem::MemKv;

    #[test]
    fn test_parse_order_insensitive() {
        let a: StorageMode = "htre".parse().unwrap();
        let b: StorageMode = "erth".parse().unwrap();
        assert_eq!(a, b);
        assert!(a.history && a.receipts && a.tx_index && a.tevm);
        assert!(!a.call_traces);
    }

    #[test]
    fn test_parse_rejects_unknown_letter() {
        let err = "hx".parse::<StorageMode>().unwrap_err();
        assert!(matches!(err, Error::InvalidStorageMode { flag: 'x' }));
    }

    #[test]
    fn test_parse_empty_is_all_off() {
        let mode: StorageMode = "".parse().unwrap();
        assert_eq!(mode, StorageMode::default());
    }

    #[test]
    fn test_display_round_trip() {
        let mode: StorageMode = "hrtce".parse().unwrap();
        assert_eq!(mode.to_string(), "hrtce");
        assert_eq!(mode.to_string().parse::<StorageMode>().unwrap(), mode);
    }

    #[test]
    fn test_persist_round_trip() {
        let kv = MemKv::new();
        let mode: StorageMode = "hc".parse().unwrap();
        kv.update(|tx| mode.write(tx)).unwrap();
        let got = kv.view(StorageMode::read).unwrap();
        assert_eq!(got, mode);
    }
}

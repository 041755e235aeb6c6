//! Backend selection.
//!
//! The writer backend set is closed and chosen by the target URI scheme:
//! `ivr:` for the transactional cloud store, `file:` for a plain local
//! directory copy.

use std::sync::Arc;

use cseg_core::config::CsegConfig;
use cseg_core::error::{Error, Result};
use cseg_core::writer::{FileWriter, SegmentWriter};

use crate::writer::IvrWriter;

pub fn writer_for_target(config: &CsegConfig) -> Result<Arc<dyn SegmentWriter>> {
    let target = config.target.as_str();
    match target.split(':').next() {
        Some("ivr") => Ok(Arc::new(IvrWriter::new(target, &config.http)?)),
        Some("file") => {
            let dir = target.trim_start_matches("file:").trim_start_matches("//");
            Ok(Arc::new(FileWriter::new(dir)?))
        }
        _ => Err(Error::InvalidConfig(format!(
            "no writer backend for target: {target}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(target: &str) -> CsegConfig {
        CsegConfig {
            target: target.to_string(),
            ..CsegConfig::default()
        }
    }

    #[test]
    fn test_ivr_scheme_selected() {
        assert!(writer_for_target(&config("ivr://host/api/file")).is_ok());
    }

    #[test]
    fn test_file_scheme_selected() {
        assert!(writer_for_target(&config("file:/var/spool/segments")).is_ok());
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let err = writer_for_target(&config("ftp://host/")).err().expect("unknown scheme");
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_empty_target_rejected() {
        assert!(writer_for_target(&config("")).is_err());
    }
}

//! Small shared helpers for the HDF5 archives.
//!
//! Every archive in the rig (camera recordings, stimulus library, analysis
//! results) stores strings as variable-length UTF-8 attributes; these
//! helpers keep that conversion in one place.

use crate::error::{AppResult, IsiError};
use hdf5::types::VarLenUnicode;

/// Write a string attribute on a file, group or dataset.
pub fn write_str_attr(location: &hdf5::Location, name: &str, value: &str) -> AppResult<()> {
    let text: VarLenUnicode = value
        .parse()
        .map_err(|e| IsiError::Internal(format!("attribute '{name}': {e}")))?;
    location
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&text)?;
    Ok(())
}

/// Read a string attribute written by [`write_str_attr`].
pub fn read_str_attr(location: &hdf5::Location, name: &str) -> AppResult<String> {
    let text = location.attr(name)?.read_scalar::<VarLenUnicode>()?;
    Ok(text.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_attr_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attrs.h5");
        {
            let file = hdf5::File::create(&path).unwrap();
            write_str_attr(&file, "direction", "LR").unwrap();
        }
        let file = hdf5::File::open(&path).unwrap();
        assert_eq!(read_str_attr(&file, "direction").unwrap(), "LR");
    }
}

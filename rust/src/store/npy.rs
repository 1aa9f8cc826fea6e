//! `.npy` encoding of field arrays, on top of `ndarray-npy`.
//!
//! Writes `<f4`. Reads `<f4` directly and narrows `<f8` to `f32`, so arrays
//! saved with plain `np.save` on float64 data still load.

use std::io::{self, Write};

use ndarray::ArrayD;
use ndarray_npy::{ReadNpyExt, WriteNpyExt};

use crate::models::FieldArray;

/// Write `array` as a complete `.npy` image.
pub fn encode<W: Write>(array: &FieldArray, writer: W) -> io::Result<()> {
    array
        .write_npy(writer)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

/// Decode a `.npy` image.
///
/// Header shapes whose element count overflows are reported as errors.
pub fn decode(bytes: &[u8]) -> Result<FieldArray, String> {
    match FieldArray::read_npy(bytes) {
        Ok(array) => Ok(array),
        Err(narrow) => ArrayD::<f64>::read_npy(bytes)
            .map(|wide| wide.mapv(|v| v as f32))
            .map_err(|_| narrow.to_string()),
    }
}

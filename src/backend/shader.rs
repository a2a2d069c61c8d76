// Shader bytecode loading
//
// Vulkan consumes SPIR-V as 4-byte words. Files are read as raw bytes,
// zero-padded to a word boundary and reinterpreted in native byte order.
// Validating the module is left to the driver.

use std::path::Path;

use super::error::{Error, Result};

/// Pack raw bytecode into native-endian words, padding the tail with zeros
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() {
        return Err(Error::ShaderFormat("empty bytecode".to_string()));
    }

    let words = bytes
        .chunks(4)
        .map(|chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_ne_bytes(word)
        })
        .collect();
    Ok(words)
}

/// Read a compiled shader from disk
pub fn read_spirv(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| Error::ShaderRead {
        path: path.to_path_buf(),
        source,
    })?;
    log::debug!("Read {} bytes of shader code from {:?}", bytes.len(), path);
    words_from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_to_word_boundary() {
        let words = words_from_bytes(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0], u32::from_ne_bytes([1, 2, 3, 4]));
        assert_eq!(words[1], u32::from_ne_bytes([5, 0, 0, 0]));
    }

    #[test]
    fn empty_code_is_a_format_error() {
        assert!(matches!(words_from_bytes(&[]), Err(Error::ShaderFormat(_))));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = read_spirv("definitely/not/here.spv").unwrap_err();
        assert!(matches!(err, Error::ShaderRead { .. }));
    }
}

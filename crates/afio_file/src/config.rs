const KIBIBYTE: usize = 1024;
const MEBIBYTE: usize = KIBIBYTE * 1024;

/// Sizes and policies fixed for the lifetime of an [`AsyncFile`](crate::AsyncFile).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncFileConfig {
    /// Capacity of the buffer that contiguous multi-page writes are coalesced into.
    /// Zero disables coalescing: every page is written on its own.
    pub write_buffer_size: usize,

    /// How many pages are requested from the page filler before they are written out, when
    /// initialising a file with `INIT`.
    pub init_pages: u32,

    /// The largest single write handed to the OS.
    pub write_chunk_size: usize,

    /// Block size and memory alignment requested when a file is opened with `DIRECT`.
    pub direct_block_size: usize,
    pub direct_alignment: usize,

    /// Auto-sync threshold used while a file is being initialised.
    pub init_autosync_bytes: u64,

    /// zstd compression level for files opened with `GZ`.
    pub compression_level: i32,
    /// Size of each of the compressed-stream input and output buffers.
    pub compression_buffer_size: usize,
}

impl Default for AsyncFileConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 256 * KIBIBYTE,
            init_pages: 32,
            write_chunk_size: 256 * KIBIBYTE,
            direct_block_size: 32 * KIBIBYTE,
            direct_alignment: 4 * KIBIBYTE,
            init_autosync_bytes: MEBIBYTE as u64,
            compression_level: 3,
            compression_buffer_size: 128 * KIBIBYTE,
        }
    }
}

impl AsyncFileConfig {
    /// Fails with a description of the first setting that can't work.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.write_chunk_size != 0, "write_chunk_size must not be zero");
        anyhow::ensure!(self.init_pages != 0, "init_pages must not be zero");
        anyhow::ensure!(
            self.direct_alignment.is_power_of_two(),
            "direct_alignment {} must be a power of two",
            self.direct_alignment
        );
        anyhow::ensure!(
            self.direct_block_size % self.direct_alignment == 0,
            "direct_block_size {} must be a multiple of direct_alignment {}",
            self.direct_block_size,
            self.direct_alignment
        );
        anyhow::ensure!(
            self.compression_buffer_size != 0,
            "compression_buffer_size must not be zero"
        );
        Ok(())
    }

    /// The staging buffer's alignment. Coalesced writes must satisfy direct I/O, too.
    pub(crate) fn buffer_alignment(&self) -> usize {
        self.direct_alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = AsyncFileConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.direct_block_size, 32768);
        assert_eq!(config.direct_alignment, 4096);
        assert_eq!(config.write_chunk_size, 262_144);
    }

    #[test]
    fn test_validate_rejects_bad_alignment() {
        let config = AsyncFileConfig {
            direct_alignment: 3000,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("power of two"), "{err}");

        let config = AsyncFileConfig {
            direct_block_size: 6 * KIBIBYTE,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("multiple of direct_alignment"), "{err}");

        let config = AsyncFileConfig {
            write_chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

//! Cubin registry
//!
//! Loaded cubins are keyed by the CRC the driver computes over their bytes.
//! Each record lazily caches SASS-to-source line info, since hot PCs are
//! sampled many times and the correlation query is expensive.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::bindings::PcSamplingApi;
use crate::error::{GpuError, Result};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LineInfoKey {
    pub function_index: u32,
    pub pc_offset: u64,
}

/// Source location of one PC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub line_number: u32,
    pub function_name: String,
    /// `dir/file`, empty when the cubin carries no line table
    pub file_path: String,
}

impl LineInfo {
    pub fn has_source(&self) -> bool {
        !self.file_path.is_empty()
    }
}

#[derive(Debug)]
pub struct CubinData {
    pub crc: u64,
    pub bytes: Vec<u8>,
    line_info: Mutex<BTreeMap<LineInfoKey, LineInfo>>,
}

impl CubinData {
    pub fn new(crc: u64, bytes: Vec<u8>) -> Self {
        Self {
            crc,
            bytes,
            line_info: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Number of cached line info entries
    pub fn line_info_len(&self) -> usize {
        self.line_info.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Source location for a PC, computed on first use and cached.
    pub fn resolve_line_info<A: PcSamplingApi>(
        &self,
        api: &A,
        function_index: u32,
        pc_offset: u64,
        function_name: &str,
    ) -> Result<LineInfo> {
        let key = LineInfoKey {
            function_index,
            pc_offset,
        };
        let mut cache = self.line_info.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(line_info) = cache.get(&key) {
            metrics::LINE_INFO_CACHE_HITS.inc();
            return Ok(line_info.clone());
        }

        let correlation = api
            .source_correlation(&self.bytes, function_name, pc_offset)
            .map_err(GpuError::driver("cuptiGetSassToSourceCorrelation", None))?;
        metrics::SOURCE_CORRELATIONS.inc();

        let file_path = match (correlation.dir_name, correlation.file_name) {
            (_, None) => String::new(),
            (None, Some(file)) => file,
            (Some(dir), Some(file)) => format!("{}/{}", dir, file),
        };
        let line_info = LineInfo {
            line_number: correlation.line_number,
            function_name: function_name.to_string(),
            file_path,
        };
        cache.insert(key, line_info.clone());
        Ok(line_info)
    }
}

/// Cubins currently loaded, keyed by CRC
#[derive(Debug, Default)]
pub struct CubinRegistry {
    cubins: RwLock<HashMap<u64, CubinData>>,
}

impl CubinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cubin, replacing any record with the same CRC.
    pub fn load_module<A: PcSamplingApi>(&self, api: &A, cubin: &[u8]) -> Result<u64> {
        let crc = api
            .cubin_crc(cubin)
            .map_err(GpuError::driver("cuptiGetCubinCrc", None))?;

        let mut cubins = self.cubins.write().unwrap_or_else(|e| e.into_inner());
        cubins.insert(crc, CubinData::new(crc, cubin.to_vec()));
        metrics::CUBINS_LOADED.set(cubins.len() as f64);

        info!("Loaded cubin {:#018x} ({} bytes)", crc, cubin.len());
        Ok(crc)
    }

    /// Evict a cubin. Unknown cubins are ignored.
    pub fn unload_module<A: PcSamplingApi>(&self, api: &A, cubin: &[u8]) -> Result<u64> {
        let crc = api
            .cubin_crc(cubin)
            .map_err(GpuError::driver("cuptiGetCubinCrc", None))?;

        let mut cubins = self.cubins.write().unwrap_or_else(|e| e.into_inner());
        if cubins.remove(&crc).is_some() {
            info!("Unloaded cubin {:#018x}", crc);
        } else {
            debug!("Unload of unknown cubin {:#018x} ignored", crc);
        }
        metrics::CUBINS_LOADED.set(cubins.len() as f64);
        Ok(crc)
    }

    pub fn contains(&self, crc: u64) -> bool {
        self.read().contains_key(&crc)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` against the record for `crc`, if loaded.
    pub fn with_cubin<R>(&self, crc: u64, f: impl FnOnce(&CubinData) -> R) -> Option<R> {
        self.read().get(&crc).map(f)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u64, CubinData>> {
        self.cubins.read().unwrap_or_else(|e| e.into_inner())
    }
}

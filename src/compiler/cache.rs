// Module Cache: compiled modules stored on disk, keyed by content
//
// A key hashes everything that decides the bytes of a module: the generated
// source, the compiler and its version, the flags, every op's C cache version
// and this crate's version. An entry lives at `<dir>/<hex key>/module.so` and
// is installed by renaming a fully written staging directory into place, so
// a concurrent reader either finds a complete module or none.

use crate::compiler::c_backend::{CCompiler, CModule};
use crate::compiler::codegen::CSource;
use crate::core::error::Result;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// File name of the shared object inside a cache entry
pub const MODULE_FILE: &str = "module.so";

static STAGING_COUNTER: AtomicUsize = AtomicUsize::new(0);

lazy_static::lazy_static! {
    /// One cache per directory and process
    static ref SHARED: Mutex<HashMap<PathBuf, Arc<ModuleCache>>> = Mutex::new(HashMap::new());
}

/// Content hash identifying a compiled module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    digest: [u8; 32],
}

fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl CacheKey {
    pub fn new(source: &CSource, compiler: &CCompiler) -> Result<Self> {
        let version = compiler.version()?;
        let mut hasher = Sha256::new();
        feed(&mut hasher, env!("CARGO_PKG_VERSION").as_bytes());
        feed(&mut hasher, source.code.as_bytes());
        feed(&mut hasher, compiler.cc().as_bytes());
        feed(&mut hasher, version.as_bytes());
        for flag in compiler.flags() {
            feed(&mut hasher, flag.as_bytes());
        }
        for (name, version) in &source.op_versions {
            feed(&mut hasher, name.as_bytes());
            hasher.update(version.to_le_bytes());
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Ok(CacheKey { digest })
    }

    pub fn hex(&self) -> String {
        self.digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", &self.hex()[..16])
    }
}

/// Counters of how modules were obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Already loaded by this cache
    pub memory_hits: usize,
    /// Found on disk and loaded
    pub disk_hits: usize,
    /// Compiled from source
    pub compiles: usize,
}

/// On-disk module cache with an in-process table of loaded modules
pub struct ModuleCache {
    dir: PathBuf,
    loaded: Mutex<HashMap<CacheKey, Arc<CModule>>>,
    stats: Mutex<CacheStats>,
}

impl fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ModuleCache")
            .field("dir", &self.dir)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ModuleCache {
    /// A private cache over `dir`; modules it loads are not shared
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ModuleCache {
            dir: dir.into(),
            loaded: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// The process-wide cache over `dir`
    pub fn shared(dir: &Path) -> Arc<ModuleCache> {
        let mut shared = SHARED.lock().unwrap_or_else(|e| e.into_inner());
        shared
            .entry(dir.to_path_buf())
            .or_insert_with(|| Arc::new(ModuleCache::new(dir)))
            .clone()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.hex())
    }

    pub fn module_path(&self, key: &CacheKey) -> PathBuf {
        self.entry_dir(key).join(MODULE_FILE)
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn count(&self, bump: impl FnOnce(&mut CacheStats)) {
        bump(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }

    /// Load the module for `key`, compiling `source` first when no entry exists.
    ///
    /// The flag is true when no compilation was needed.
    pub fn get_or_compile(
        &self,
        key: &CacheKey,
        source: &CSource,
        compiler: &CCompiler,
    ) -> Result<(Arc<CModule>, bool)> {
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(module) = loaded.get(key) {
            log::debug!("module {}: already loaded", key);
            self.count(|s| s.memory_hits += 1);
            return Ok((module.clone(), true));
        }

        let path = self.module_path(key);
        let cached = path.exists();
        if cached {
            log::info!("module {}: cache hit in {}", key, self.dir.display());
            self.count(|s| s.disk_hits += 1);
        } else {
            self.install(key, source, compiler)?;
            self.count(|s| s.compiles += 1);
        }
        let module = Arc::new(CModule::load(&path)?);
        loaded.insert(*key, module.clone());
        Ok((module, cached))
    }

    /// Compile into a staging directory, then rename it into place
    fn install(&self, key: &CacheKey, source: &CSource, compiler: &CCompiler) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let staging = self.dir.join(format!(
            "tmp-{}-{}-{}",
            key.hex(),
            process::id(),
            STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&staging)?;
        let result = Self::build_entry(&staging, source, compiler);
        if let Err(err) = result {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }

        let target = self.entry_dir(key);
        if let Err(err) = fs::rename(&staging, &target) {
            let _ = fs::remove_dir_all(&staging);
            if !target.join(MODULE_FILE).exists() {
                return Err(err.into());
            }
            // another process installed the same key first
            log::debug!("module {}: lost the install race, using the existing entry", key);
        }
        Ok(())
    }

    fn build_entry(staging: &Path, source: &CSource, compiler: &CCompiler) -> Result<()> {
        let src = staging.join("module.c");
        fs::write(&src, &source.code)?;
        compiler.compile(&src, &staging.join(MODULE_FILE))?;
        let ops: Vec<String> = source
            .op_versions
            .iter()
            .map(|(name, v)| format!("{} v{}", name, v))
            .collect();
        fs::write(
            staging.join("key.txt"),
            format!(
                "{}\n{}\n{}\n",
                compiler.cc(),
                compiler.flags().join(" "),
                ops.join("\n")
            ),
        )?;
        Ok(())
    }
}

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tonconnect_crypto::StoreKey;
use tonconnect_crypto::keystore::STORE_KEY_BYTES;
use zeroize::Zeroizing;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

const DEFAULT_STATE_DIR: &str = ".local/state/tonconnect";
const STORE_KEY_FILE: &str = "store.key";

/// Name of the session database inside the state directory.
pub const SESSIONS_DB_FILE: &str = "sessions.db";

/// Return the tonconnect state directory path.
///
/// Priority: `$TONCONNECT_STATE_DIR` env var, then `~/.local/state/tonconnect`.
pub fn default_state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("TONCONNECT_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("HOME env var not set")?;
    Ok(PathBuf::from(home).join(DEFAULT_STATE_DIR))
}

/// Ensure the state directory exists with `0700` permissions.
pub fn ensure_state_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create state dir {}", path.display()))?;
    }
    #[cfg(unix)]
    {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to set state dir permissions {}", path.display()))?;
    }
    Ok(())
}

/// Load the store key material from `store.key`, creating it on first run.
pub fn load_or_create_store_key(state_dir: &Path) -> Result<StoreKey> {
    let path = state_dir.join(STORE_KEY_FILE);
    if path.exists() {
        let encoded = Zeroizing::new(
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        );
        let material = Zeroizing::new(
            hex::decode(encoded.trim()).context("store key file is not valid hex")?,
        );
        if material.len() != STORE_KEY_BYTES {
            bail!(
                "store key file has {} bytes, expected {STORE_KEY_BYTES}",
                material.len()
            );
        }
        return Ok(StoreKey::derive(&material));
    }

    let material = StoreKey::generate_material()?;
    let encoded = Zeroizing::new(hex::encode(&material[..]));
    write_private(&path, encoded.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "created session store key");
    Ok(StoreKey::derive(&material[..]))
}

/// Create `path` readable only by the owner and write `contents` to it.
/// Fails if the file already exists.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

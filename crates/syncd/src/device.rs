//! Device identity: created once, persisted, immutable thereafter. A
//! single row in `sync_device` (`id = 0`, enforced by a `CHECK` constraint
//! so there is never more than one local identity). The keypair is
//! generated once at first boot and its seed persisted into the embedded
//! store rather than a standalone key file, since this engine has no
//! separate config directory of its own.

use rusqlite::{params, Connection, OptionalExtension};
use sync_proto::crypto::DeviceKeyPair;
use sync_proto::id::Id128;
use sync_proto::types::Device;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("device identity already initialized")]
    AlreadyInitialized,
    #[error("no device identity has been initialized; run `init` first")]
    NotInitialized,
}

type Result<T> = std::result::Result<T, DeviceError>;

/// Create and persist the local device identity. A signing keypair is
/// always generated and its seed stored (so signing can be turned on
/// later without losing the original identity); the public key is only
/// recorded on the `Device` itself — and so exposed to peers — when
/// `enable_signing` is set.
pub fn create(conn: &Connection, display_name: &str, enable_signing: bool) -> Result<(Device, DeviceKeyPair)> {
    if load(conn)?.is_some() {
        return Err(DeviceError::AlreadyInitialized);
    }

    let device_id = Id128::new();
    let keypair = DeviceKeyPair::generate();
    let public_key = enable_signing.then(|| keypair.public_key().to_bytes());

    conn.execute(
        "INSERT INTO sync_device (id, device_id, display_name, public_key, seed) VALUES (0, ?1, ?2, ?3, ?4)",
        params![
            device_id.as_bytes(),
            display_name,
            public_key.map(|b| b.to_vec()),
            keypair.seed_bytes().to_vec(),
        ],
    )?;

    Ok((
        Device {
            device_id,
            display_name: display_name.to_string(),
            public_key,
        },
        keypair,
    ))
}

/// Load the local device identity, if one has been created.
pub fn load(conn: &Connection) -> Result<Option<(Device, DeviceKeyPair)>> {
    conn.query_row(
        "SELECT device_id, display_name, public_key, seed FROM sync_device WHERE id = 0",
        [],
        |row| {
            let device_id: [u8; 16] = row.get(0)?;
            let display_name: String = row.get(1)?;
            let public_key: Option<Vec<u8>> = row.get(2)?;
            let seed: Vec<u8> = row.get(3)?;
            Ok((device_id, display_name, public_key, seed))
        },
    )
    .optional()
    .map_err(DeviceError::from)?
    .map(|(device_id, display_name, public_key, seed)| {
        let mut seed_arr = [0u8; 32];
        seed_arr.copy_from_slice(&seed);
        let keypair = DeviceKeyPair::from_seed(&seed_arr);
        let public_key = public_key.map(|b| {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&b);
            arr
        });
        (
            Device {
                device_id: Id128(device_id),
                display_name,
                public_key,
            },
            keypair,
        )
    })
    .map(Some)
    .or(Ok(None))
}

/// Load the local device identity, failing if `init` was never run.
pub fn require(conn: &Connection) -> Result<(Device, DeviceKeyPair)> {
    load(conn)?.ok_or(DeviceError::NotInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::open_in_memory;

    #[test]
    fn create_then_load_round_trips() {
        let conn = open_in_memory().unwrap();
        let (created, keypair) = create(&conn, "laptop", false).unwrap();
        let (loaded, loaded_keypair) = load(&conn).unwrap().unwrap();
        assert_eq!(loaded.device_id, created.device_id);
        assert_eq!(loaded.display_name, "laptop");
        assert!(loaded.public_key.is_none());
        assert_eq!(loaded_keypair.public_key(), keypair.public_key());
    }

    #[test]
    fn signing_enabled_persists_public_key() {
        let conn = open_in_memory().unwrap();
        let (created, keypair) = create(&conn, "phone", true).unwrap();
        assert_eq!(created.public_key, Some(keypair.public_key().to_bytes()));
    }

    #[test]
    fn creating_twice_fails() {
        let conn = open_in_memory().unwrap();
        create(&conn, "laptop", false).unwrap();
        assert!(matches!(create(&conn, "laptop2", false), Err(DeviceError::AlreadyInitialized)));
    }

    #[test]
    fn require_without_init_fails() {
        let conn = open_in_memory().unwrap();
        assert!(matches!(require(&conn), Err(DeviceError::NotInitialized)));
    }
}

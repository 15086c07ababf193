//! Known peers and node preferences, persisted as versioned byte records.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::packet::{MAX_PATH_SIZE, PUB_KEY_SIZE};
use crate::radio::RadioParams;

pub const CONTACTS_FILE_VERSION: u8 = 1;
pub const PREFS_FILE_VERSION: u8 = 1;

pub const MAX_CONTACTS: usize = 100;
pub const CONTACT_NAME_SIZE: usize = 32;
/// Persisted size of one contact, after the file's version byte.
pub const CONTACT_RECORD_SIZE: usize = PUB_KEY_SIZE + CONTACT_NAME_SIZE + 3 + 4 + 1 + 4 + MAX_PATH_SIZE + 8 + 8;

pub const ADV_TYPE_CHAT: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("encode: {0}")]
    Encode(#[from] bincode::Error),
    #[error("contact book full")]
    Full,
    #[error("path of {0} hops exceeds limit")]
    PathTooLong(usize),
}

/// One known peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactRecord {
    pub public_key: [u8; PUB_KEY_SIZE],
    pub name: String,
    pub contact_type: u8,
    pub flags: u8,
    /// Learned hop sequence to the peer; `None` means deliver by flood.
    pub out_path: Option<Vec<u8>>,
    pub last_advert: u32,
    pub latitude: f64,
    pub longitude: f64,
}

impl ContactRecord {
    pub fn new(public_key: [u8; PUB_KEY_SIZE], name: impl Into<String>) -> Self {
        Self {
            public_key,
            name: name.into(),
            contact_type: ADV_TYPE_CHAT,
            flags: 0,
            out_path: None,
            last_advert: 0,
            latitude: 0.0,
            longitude: 0.0,
        }
    }

    /// One-byte address used in packet headers.
    pub fn hash(&self) -> u8 {
        self.public_key[0]
    }

    /// Forget the direct path so the next send floods.
    pub fn reset_path(&mut self) {
        self.out_path = None;
    }

    pub fn set_path(&mut self, path: Vec<u8>) -> Result<(), StoreError> {
        if path.len() > MAX_PATH_SIZE {
            return Err(StoreError::PathTooLong(path.len()));
        }
        self.out_path = Some(path);
        Ok(())
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), StoreError> {
        let mut buf = [0u8; CONTACT_RECORD_SIZE];
        let mut pos = 0;
        let mut put = |bytes: &[u8]| {
            buf[pos..pos + bytes.len()].copy_from_slice(bytes);
            pos += bytes.len();
        };
        put(&self.public_key);
        put(&name_bytes(&self.name));
        put(&[self.contact_type, self.flags, 0]);
        put(&[0; 4]);
        let (path_len, path) = match &self.out_path {
            Some(p) if p.len() <= MAX_PATH_SIZE => {
                let mut padded = [0u8; MAX_PATH_SIZE];
                padded[..p.len()].copy_from_slice(p);
                (p.len() as i8, padded)
            }
            Some(p) => return Err(StoreError::PathTooLong(p.len())),
            None => (-1i8, [0u8; MAX_PATH_SIZE]),
        };
        put(&path_len.to_le_bytes());
        put(&self.last_advert.to_le_bytes());
        put(&path);
        put(&self.latitude.to_le_bytes());
        put(&self.longitude.to_le_bytes());
        w.write_all(&buf)?;
        Ok(())
    }

    /// Read one record. `Ok(None)` on a short read.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<Self>, StoreError> {
        let mut buf = [0u8; CONTACT_RECORD_SIZE];
        match r.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let mut public_key = [0u8; PUB_KEY_SIZE];
        public_key.copy_from_slice(&buf[..32]);
        let name = name_from(&buf[32..64]);
        let contact_type = buf[64];
        let flags = buf[65];
        // 66: unused, 67..71: reserved
        let path_len = buf[71] as i8;
        let last_advert = u32::from_le_bytes([buf[72], buf[73], buf[74], buf[75]]);
        let path_bytes = &buf[76..76 + MAX_PATH_SIZE];
        let out_path = usize::try_from(path_len)
            .ok()
            .filter(|&n| n <= MAX_PATH_SIZE)
            .map(|n| path_bytes[..n].to_vec());
        let lat_at = 76 + MAX_PATH_SIZE;
        let mut f = [0u8; 8];
        f.copy_from_slice(&buf[lat_at..lat_at + 8]);
        let latitude = f64::from_le_bytes(f);
        f.copy_from_slice(&buf[lat_at + 8..lat_at + 16]);
        let longitude = f64::from_le_bytes(f);

        Ok(Some(Self {
            public_key,
            name,
            contact_type,
            flags,
            out_path,
            last_advert,
            latitude,
            longitude,
        }))
    }
}

fn name_bytes(name: &str) -> [u8; CONTACT_NAME_SIZE] {
    let mut out = [0u8; CONTACT_NAME_SIZE];
    let mut end = name.len().min(CONTACT_NAME_SIZE - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    out[..end].copy_from_slice(&name.as_bytes()[..end]);
    out
}

fn name_from(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Read a contacts file: version byte, then records until the first short read.
pub fn load_contacts<R: Read>(r: &mut R) -> Result<Vec<ContactRecord>, StoreError> {
    let mut version = [0u8; 1];
    match r.read_exact(&mut version) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    }
    if version[0] != CONTACTS_FILE_VERSION {
        tracing::warn!(version = version[0], "unexpected contacts file version");
    }
    let mut out = Vec::new();
    while let Some(record) = ContactRecord::read_from(r)? {
        out.push(record);
    }
    Ok(out)
}

pub fn save_contacts<'a, W: Write>(
    w: &mut W,
    contacts: impl IntoIterator<Item = &'a ContactRecord>,
) -> Result<(), StoreError> {
    w.write_all(&[CONTACTS_FILE_VERSION])?;
    for c in contacts {
        c.write_to(w)?;
    }
    w.flush()?;
    Ok(())
}

/// Bounded set of known peers.
#[derive(Debug, Clone, Default)]
pub struct ContactBook {
    contacts: Vec<ContactRecord>,
}

impl ContactBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<R: Read>(r: &mut R) -> Result<Self, StoreError> {
        let mut contacts = load_contacts(r)?;
        if contacts.len() > MAX_CONTACTS {
            tracing::warn!(count = contacts.len(), "contacts file over capacity, truncating");
            contacts.truncate(MAX_CONTACTS);
        }
        Ok(Self { contacts })
    }

    pub fn save<W: Write>(&self, w: &mut W) -> Result<(), StoreError> {
        save_contacts(w, &self.contacts)
    }

    /// Insert, or replace the record with the same public key.
    pub fn upsert(&mut self, record: ContactRecord) -> Result<(), StoreError> {
        if let Some(existing) = self.by_key_mut(&record.public_key) {
            *existing = record;
            return Ok(());
        }
        if self.contacts.len() >= MAX_CONTACTS {
            return Err(StoreError::Full);
        }
        self.contacts.push(record);
        Ok(())
    }

    pub fn by_key(&self, key: &[u8; PUB_KEY_SIZE]) -> Option<&ContactRecord> {
        self.contacts.iter().find(|c| &c.public_key == key)
    }

    pub fn by_key_mut(&mut self, key: &[u8; PUB_KEY_SIZE]) -> Option<&mut ContactRecord> {
        self.contacts.iter_mut().find(|c| &c.public_key == key)
    }

    /// First contact whose key starts with `hash`.
    pub fn by_hash(&self, hash: u8) -> Option<&ContactRecord> {
        self.contacts.iter().find(|c| c.hash() == hash)
    }

    /// First contact whose name starts with `prefix`, case-insensitive.
    pub fn by_name_prefix(&self, prefix: &str) -> Option<&ContactRecord> {
        let prefix = prefix.to_lowercase();
        self.contacts
            .iter()
            .find(|c| c.name.to_lowercase().starts_with(&prefix))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContactRecord> {
        self.contacts.iter()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

/// Node-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePrefs {
    pub airtime_factor: f32,
    pub node_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub freq_mhz: f32,
    pub tx_power_dbm: i8,
    pub bandwidth_khz: f32,
    pub spreading_factor: u8,
    pub coding_rate: u8,
    /// Use ANSI colour in the chat console.
    pub colour: bool,
}

impl Default for NodePrefs {
    fn default() -> Self {
        let radio = RadioParams::default();
        Self {
            airtime_factor: 1.0,
            node_name: "mesh-node".to_owned(),
            latitude: 0.0,
            longitude: 0.0,
            freq_mhz: radio.freq_mhz,
            tx_power_dbm: radio.tx_power_dbm,
            bandwidth_khz: radio.bandwidth_khz,
            spreading_factor: radio.spreading_factor,
            coding_rate: radio.coding_rate,
            colour: true,
        }
    }
}

impl NodePrefs {
    pub fn radio_params(&self) -> RadioParams {
        RadioParams {
            freq_mhz: self.freq_mhz,
            bandwidth_khz: self.bandwidth_khz,
            spreading_factor: self.spreading_factor,
            coding_rate: self.coding_rate,
            tx_power_dbm: self.tx_power_dbm,
        }
    }

    pub fn load<R: Read>(r: &mut R) -> Result<Self, StoreError> {
        let mut version = [0u8; 1];
        r.read_exact(&mut version)?;
        if version[0] != PREFS_FILE_VERSION {
            tracing::warn!(version = version[0], "unexpected prefs file version");
        }
        Ok(bincode::deserialize_from(r)?)
    }

    pub fn save<W: Write>(&self, w: &mut W) -> Result<(), StoreError> {
        w.write_all(&[PREFS_FILE_VERSION])?;
        bincode::serialize_into(&mut *w, self)?;
        w.flush()?;
        Ok(())
    }
}

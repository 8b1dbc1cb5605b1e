//! System Description Table management
//!
//! The store keeps installed table images, deduplicates re-installs, and
//! pins mappings for clients holding a table reference. Running a table's
//! AML happens in the interpreter; `Load` pushes a table frame onto the
//! running frame chain instead of recursing.

use crate::consts::TABLE_HEADER_LEN;
use crate::error::AmlError;
use crate::object::CodeSlice;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

/// Fixed 36-byte header every System Description Table starts with.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TableHeader {
    /// Table signature, e.g. `DSDT` or `SSDT`.
    pub signature: [u8; 4],
    /// Total table length including this header.
    pub length: u32,
    /// Table revision; selects integer width for AML tables.
    pub revision: u8,
    /// Whole-table checksum byte (validation is the discoverer's job).
    pub checksum: u8,
    /// OEM identifier.
    pub oem_id: [u8; 6],
    /// OEM table identifier.
    pub oem_table_id: [u8; 8],
    /// OEM revision number.
    pub oem_revision: u32,
    /// Creator tool identifier.
    pub creator_id: [u8; 4],
    /// Creator tool revision.
    pub creator_revision: u32,
}

impl TableHeader {
    /// Parse the fixed header from the start of a table image.
    pub fn parse(image: &[u8]) -> Result<Self, AmlError> {
        if image.len() < TABLE_HEADER_LEN {
            return Err(AmlError::BadBytecode("table shorter than its header"));
        }
        let mut signature = [0u8; 4];
        signature.copy_from_slice(&image[0..4]);
        let length = u32::from_le_bytes([image[4], image[5], image[6], image[7]]);
        let mut oem_id = [0u8; 6];
        oem_id.copy_from_slice(&image[10..16]);
        let mut oem_table_id = [0u8; 8];
        oem_table_id.copy_from_slice(&image[16..24]);
        let mut creator_id = [0u8; 4];
        creator_id.copy_from_slice(&image[28..32]);
        Ok(Self {
            signature,
            length,
            revision: image[8],
            checksum: image[9],
            oem_id,
            oem_table_id,
            oem_revision: u32::from_le_bytes([image[24], image[25], image[26], image[27]]),
            creator_id,
            creator_revision: u32::from_le_bytes([image[32], image[33], image[34], image[35]]),
        })
    }

    /// Signature as text.
    pub fn signature_str(&self) -> &str {
        core::str::from_utf8(&self.signature).unwrap_or("????")
    }
}

/// One installed table.
#[derive(Debug)]
pub struct Table {
    /// Handle and namespace owner id of nodes this table created.
    pub id: u32,
    /// Parsed fixed header.
    pub header: TableHeader,
    /// Full image including the header.
    pub data: Arc<Vec<u8>>,
    pins: AtomicU32,
    loaded: AtomicBool,
}

impl Table {
    /// AML byte window following the header.
    pub fn aml(&self) -> CodeSlice {
        let end = (self.header.length as usize).min(self.data.len());
        CodeSlice::new(self.data.clone(), TABLE_HEADER_LEN.min(end), end)
    }

    /// Pin the table mapping.
    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one pin.
    pub fn unpin(&self) {
        let prior = self.pins.fetch_sub(1, Ordering::AcqRel);
        if prior == 0 {
            warn!(target: "aml_vm::table", table = self.header.signature_str(), "unpin without pin");
            self.pins.store(0, Ordering::Release);
        }
    }

    /// Current pin count.
    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    /// Whether the table's AML has been run.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Mark the table's AML as run.
    pub fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }
}

/// Decision hook consulted before a table is installed.
pub type InstallHook = Box<dyn Fn(&TableHeader) -> bool + Send + Sync>;

/// The loaded-table list.
pub struct TableStore {
    tables: Mutex<Vec<Arc<Table>>>,
    hook: RwLock<Option<InstallHook>>,
}

impl core::fmt::Debug for TableStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "TableStore({} tables)", self.len())
    }
}

impl TableStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Vec::new()),
            hook: RwLock::new(None),
        }
    }

    /// Number of installed tables.
    pub fn len(&self) -> usize {
        lock(&self.tables).len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the installation decision hook.
    pub fn set_install_hook(&self, hook: Option<InstallHook>) {
        let mut slot = match self.hook.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = hook;
    }

    /// Install a table from a byte image under handle `id` (the caller
    /// allocates it, typically [`crate::context::Context::allocate_owner`]).
    ///
    /// Re-installing a byte-identical image yields the existing entry;
    /// a hook refusal surfaces as denial.
    pub fn install(&self, image: &[u8], id: u32) -> Result<Arc<Table>, AmlError> {
        let header = TableHeader::parse(image)?;
        if (header.length as usize) > image.len() {
            return Err(AmlError::BadBytecode("table length beyond image"));
        }
        {
            let hook = match self.hook.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(hook) = hook.as_ref() {
                if !hook(&header) {
                    return Err(AmlError::Denied);
                }
            }
        }
        let mut tables = lock(&self.tables);
        if let Some(existing) = tables
            .iter()
            .find(|t| t.header == header && t.data.as_slice() == &image[..t.data.len()])
        {
            return Ok(existing.clone());
        }
        let table = Arc::new(Table {
            id,
            data: Arc::new(image[..header.length as usize].to_vec()),
            header,
            pins: AtomicU32::new(0),
            loaded: AtomicBool::new(false),
        });
        info!(
            target: "aml_vm::table",
            signature = table.header.signature_str(),
            length = table.header.length,
            id = table.id,
            "table installed"
        );
        tables.push(table.clone());
        Ok(table)
    }

    /// Table by handle.
    pub fn get(&self, id: u32) -> Option<Arc<Table>> {
        lock(&self.tables).iter().find(|t| t.id == id).cloned()
    }

    /// Find by signature with optional OEM filters, skipping the first
    /// `skip` matches.
    pub fn find(
        &self,
        signature: &str,
        oem_id: Option<&str>,
        oem_table_id: Option<&str>,
        skip: usize,
    ) -> Option<Arc<Table>> {
        lock(&self.tables)
            .iter()
            .filter(|t| {
                t.header.signature_str() == signature
                    && oem_id.map_or(true, |want| id_matches(&t.header.oem_id, want))
                    && oem_table_id.map_or(true, |want| id_matches(&t.header.oem_table_id, want))
            })
            .nth(skip)
            .cloned()
    }

    /// Remove a table by handle; refuses while pinned.
    pub fn remove(&self, id: u32) -> Result<Arc<Table>, AmlError> {
        let mut tables = lock(&self.tables);
        let at = tables
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| AmlError::NotFound(format!("table {id}")))?;
        if tables[at].pin_count() > 0 {
            return Err(AmlError::StillInUse("table is pinned"));
        }
        Ok(tables.remove(at))
    }

    /// Snapshot of every installed table.
    pub fn list(&self) -> Vec<Arc<Table>> {
        lock(&self.tables).clone()
    }
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}

fn id_matches(field: &[u8], want: &str) -> bool {
    // OEM fields are fixed width, space or nul padded.
    let text: &[u8] = field
        .split(|b| *b == 0 || *b == b' ')
        .next()
        .unwrap_or(field);
    text == want.as_bytes()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Assemble a table image from header fields and AML bytes, for tests and
/// synthetic tables.
pub fn build_table(signature: &str, revision: u8, oem_table_id: &str, aml: &[u8]) -> Vec<u8> {
    let length = (TABLE_HEADER_LEN + aml.len()) as u32;
    let mut image = Vec::with_capacity(length as usize);
    image.extend_from_slice(&signature.as_bytes()[..4]);
    image.extend_from_slice(&length.to_le_bytes());
    image.push(revision);
    image.push(0); // checksum patched below
    image.extend_from_slice(b"AMLVM ");
    let mut oem_table = [b' '; 8];
    let id = oem_table_id.as_bytes();
    oem_table[..id.len().min(8)].copy_from_slice(&id[..id.len().min(8)]);
    image.extend_from_slice(&oem_table);
    image.extend_from_slice(&1u32.to_le_bytes());
    image.extend_from_slice(b"AVMC");
    image.extend_from_slice(&1u32.to_le_bytes());
    image.extend_from_slice(aml);
    let sum: u8 = image.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    image[9] = (!sum).wrapping_add(1);
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parses_fixed_fields() {
        let image = build_table("SSDT", 2, "TESTTAB", &[0xa3]);
        let header = TableHeader::parse(&image).unwrap();
        assert_eq!(header.signature_str(), "SSDT");
        assert_eq!(header.revision, 2);
        assert_eq!(header.length as usize, image.len());
    }

    #[test]
    fn install_deduplicates_identical_images() {
        let store = TableStore::new();
        let image = build_table("SSDT", 2, "DUP", &[0xa3]);
        let first = store.install(&image, 1).unwrap();
        let second = store.install(&image, 2).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn find_filters_by_oem_table_id() {
        let store = TableStore::new();
        store
            .install(&build_table("SSDT", 2, "AAA", &[0xa3]), 1)
            .unwrap();
        store
            .install(&build_table("SSDT", 2, "BBB", &[0xa3, 0xa3]), 2)
            .unwrap();
        let found = store.find("SSDT", None, Some("BBB"), 0).unwrap();
        assert_eq!(found.header.oem_table_id[..3].to_vec(), b"BBB".to_vec());
        assert!(store.find("SSDT", None, Some("CCC"), 0).is_none());
        assert!(store.find("SSDT", None, None, 1).is_some());
        assert!(store.find("SSDT", None, None, 2).is_none());
    }

    #[test]
    fn pinned_tables_cannot_be_removed() {
        let store = TableStore::new();
        let table = store
            .install(&build_table("SSDT", 2, "PIN", &[0xa3]), 1)
            .unwrap();
        table.pin();
        assert!(matches!(
            store.remove(table.id),
            Err(AmlError::StillInUse(_))
        ));
        table.unpin();
        store.remove(table.id).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn hook_can_deny_installation() {
        let store = TableStore::new();
        store.set_install_hook(Some(Box::new(|header| {
            header.signature_str() != "SSDT"
        })));
        let denied = store.install(&build_table("SSDT", 2, "NO", &[]), 1);
        assert!(matches!(denied, Err(AmlError::Denied)));
        store.set_install_hook(None);
        assert!(store.install(&build_table("SSDT", 2, "NO", &[]), 2).is_ok());
    }

    #[test]
    fn aml_window_skips_the_header() {
        let store = TableStore::new();
        let table = store
            .install(&build_table("SSDT", 2, "WIN", &[0xa3, 0xa4, 0x00]), 1)
            .unwrap();
        assert_eq!(table.aml().bytes(), &[0xa3, 0xa4, 0x00]);
    }
}

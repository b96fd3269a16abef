//! Metadata-first object store layered over exFAT
//!
//! Every object has a stable [`ObjectId`]. Its bytes live in `/data/<hex>`,
//! human names live in link files under `/views/<view>/<name>`, and the
//! index of objects and views is kept in memory and written to
//! `/.kernel/objects.db` on sync.

use crate::filesys::exfat::ExFat;
use crate::filesys::{BlockDevice, FileSystem, FsError};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use log::{debug, info, warn};

mod index;
mod object;
mod path;
mod view;

pub use index::{
    ExtendedMetadata, IndexEntry, ObjectMetadata, EXTENSION_MAX, NAME_MAX, RECORD_SIZE, TAGS_MAX,
    VIEW_MAX,
};
pub use object::{
    crc32, infer_type, type_to_string, validate_metadata, CoreMetadata, ObjectId, ObjectType,
    META_FLAG_EXECUTABLE, META_MAGIC, META_VERSION,
};
pub use path::{
    normalize_path, path_get_view, shell_path_is_valid, split_object_path, Reference, MAX_DEPTH,
};
pub use view::{
    default_views, ViewDefinition, ViewEntry, ViewKind, SYSTEM_VIEWS, VIEW_NAME_MAX,
    VIEW_RECORD_SIZE,
};

/// Index capacity
pub const MAX_OBJECTS: usize = 1024;
pub const MAX_VIEWS: usize = 64;
/// Most entries returned by one view listing
pub const VIEW_LIST_MAX: usize = 128;

pub const KERNEL_DIR: &str = "/.kernel";
pub const DATA_DIR: &str = "/data";
pub const VIEWS_DIR: &str = "/views";
pub const DB_PATH: &str = "/.kernel/objects.db";

/// "MDB "
pub const DB_MAGIC: u32 = 0x4D44_4220;
pub const DB_VERSION: u32 = 1;
/// magic, version, object count, view count, last sync, last object id
pub const DB_HEADER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaFsError {
    /// The exFAT layer failed
    Fs(FsError),
    IndexFull,
    ObjectNotFound,
    /// Malformed or too deep a path
    InvalidPath,
    /// A link file that is not 16 hex digits
    InvalidLink,
    /// A link naming an object that is no longer indexed
    DanglingLink(ObjectId),
    /// The object database is missing its magic or truncated
    BadIndex,
    ViewExists,
    ViewNotFound,
    ViewTableFull,
    AttributeTooLong,
    /// An empty tag or one containing the separator
    InvalidAttribute,
    /// Closing a handle that is not open
    NotOpen,
}

impl From<FsError> for MetaFsError {
    fn from(e: FsError) -> Self {
        MetaFsError::Fs(e)
    }
}

impl fmt::Display for MetaFsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaFsError::Fs(e) => write!(f, "volume error: {}", e),
            MetaFsError::IndexFull => f.write_str("object index is full"),
            MetaFsError::ObjectNotFound => f.write_str("object not found"),
            MetaFsError::InvalidPath => f.write_str("invalid path"),
            MetaFsError::InvalidLink => f.write_str("link file is not an object id"),
            MetaFsError::DanglingLink(id) => write!(f, "link points to missing object {}", id),
            MetaFsError::BadIndex => f.write_str("object database is corrupt"),
            MetaFsError::ViewExists => f.write_str("view already exists"),
            MetaFsError::ViewNotFound => f.write_str("view not found"),
            MetaFsError::ViewTableFull => f.write_str("too many views"),
            MetaFsError::AttributeTooLong => f.write_str("attribute too long"),
            MetaFsError::InvalidAttribute => f.write_str("invalid attribute value"),
            MetaFsError::NotOpen => f.write_str("object handle is not open"),
        }
    }
}

/// An opened object with a snapshot of its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHandle {
    pub id: ObjectId,
    pub is_open: bool,
    pub metadata: ObjectMetadata,
}

fn data_path(id: ObjectId) -> String {
    format!("{}/{}", DATA_DIR, id.to_hex())
}

fn link_path(view: &str, name: &str) -> String {
    format!("{}/{}/{}", VIEWS_DIR, view, name)
}

fn check_len(value: &str, max: usize) -> Result<(), MetaFsError> {
    if value.len() > max {
        Err(MetaFsError::AttributeTooLong)
    } else {
        Ok(())
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    read_u32(bytes, at) as u64 | (read_u32(bytes, at + 4) as u64) << 32
}

/// The object store. Owns its exFAT volume.
pub struct MetaFs<D: BlockDevice> {
    volume: ExFat<D>,
    index: Vec<IndexEntry>,
    views: Vec<ViewDefinition>,
    /// Highest id ever handed out or persisted
    last_object_id: u64,
    /// Incremented by every save
    last_sync: u64,
}

impl<D: BlockDevice> MetaFs<D> {
    /// Wraps a mounted volume with an empty index and no views.
    pub fn new(volume: ExFat<D>) -> Self {
        info!("metafs: initialized with capacity for {} objects", MAX_OBJECTS);
        Self {
            volume,
            index: Vec::with_capacity(MAX_OBJECTS),
            views: Vec::new(),
            last_object_id: 0,
            last_sync: 0,
        }
    }

    pub fn volume(&self) -> &ExFat<D> {
        &self.volume
    }

    /// Direct volume access for the few bootstrap files kept outside the
    /// object store.
    pub fn volume_mut(&mut self) -> &mut ExFat<D> {
        &mut self.volume
    }

    pub fn into_volume(self) -> ExFat<D> {
        self.volume
    }

    pub fn objects(&self) -> &[IndexEntry] {
        &self.index
    }

    pub fn object_count(&self) -> usize {
        self.index.len()
    }

    pub fn views(&self) -> &[ViewDefinition] {
        &self.views
    }

    pub fn last_sync(&self) -> u64 {
        self.last_sync
    }

    /// Installs the default views and creates the directories behind them.
    pub fn format(&mut self) -> Result<(), MetaFsError> {
        info!("metafs: formatting");
        self.views = default_views();
        self.ensure_layout()?;
        info!(
            "metafs: format complete, {} views ({} system)",
            self.views.len(),
            SYSTEM_VIEWS.len()
        );
        Ok(())
    }

    /// Loads the persisted index if there is one. Returns whether it did;
    /// a missing or corrupt database leaves the store empty.
    pub fn mount(&mut self) -> Result<bool, MetaFsError> {
        let loaded = match self.load_index() {
            Ok(()) => {
                info!("metafs: loaded {} objects", self.index.len());
                true
            }
            Err(e) => {
                info!("metafs: no usable index ({}), starting fresh", e);
                false
            }
        };
        self.ensure_layout()?;
        Ok(loaded)
    }

    /// Writes the index to disk.
    pub fn sync(&mut self) -> Result<(), MetaFsError> {
        self.save_index()
    }

    fn ensure_layout(&mut self) -> Result<(), MetaFsError> {
        self.volume.create_dir_all(KERNEL_DIR)?;
        self.volume.create_dir_all(DATA_DIR)?;
        self.volume.create_dir_all(VIEWS_DIR)?;
        for view in &self.views {
            self.volume.create_dir_all(&format!("{}/{}", VIEWS_DIR, view.name))?;
        }
        Ok(())
    }

    fn encode_index(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            DB_HEADER_SIZE + self.index.len() * RECORD_SIZE + self.views.len() * VIEW_RECORD_SIZE,
        );
        bytes.extend_from_slice(&DB_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&DB_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.index.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.views.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.last_sync.to_le_bytes());
        bytes.extend_from_slice(&self.last_object_id.to_le_bytes());
        for entry in &self.index {
            bytes.extend_from_slice(&entry.to_record());
        }
        for view in &self.views {
            bytes.extend_from_slice(&view.to_record());
        }
        bytes
    }

    pub fn save_index(&mut self) -> Result<(), MetaFsError> {
        self.last_sync += 1;
        let bytes = self.encode_index();
        self.volume.create_dir_all(KERNEL_DIR)?;
        let written = self.volume.write_new(DB_PATH, &bytes)?;
        if written != bytes.len() {
            return Err(FsError::NoSpace.into());
        }
        debug!(
            "metafs: saved {} objects and {} views ({} bytes)",
            self.index.len(),
            self.views.len(),
            bytes.len()
        );
        Ok(())
    }

    /// Replaces the in-memory index with the persisted one. Nothing changes
    /// on failure. Records whose core metadata fails validation are dropped.
    pub fn load_index(&mut self) -> Result<(), MetaFsError> {
        let bytes = self.volume.read_to_vec(DB_PATH)?;
        if bytes.len() < DB_HEADER_SIZE || read_u32(&bytes, 0) != DB_MAGIC {
            warn!("metafs: object database has a bad header");
            return Err(MetaFsError::BadIndex);
        }
        if read_u32(&bytes, 4) != DB_VERSION {
            return Err(MetaFsError::BadIndex);
        }
        let num_objects = read_u32(&bytes, 8) as usize;
        let num_views = read_u32(&bytes, 12) as usize;
        if num_objects > MAX_OBJECTS || num_views > MAX_VIEWS {
            return Err(MetaFsError::BadIndex);
        }
        let views_at = DB_HEADER_SIZE + num_objects * RECORD_SIZE;
        if bytes.len() != views_at + num_views * VIEW_RECORD_SIZE {
            warn!("metafs: object database is truncated");
            return Err(MetaFsError::BadIndex);
        }

        let mut index = Vec::with_capacity(MAX_OBJECTS);
        let mut last_object_id = read_u64(&bytes, 24);
        for record in bytes[DB_HEADER_SIZE..views_at].chunks_exact(RECORD_SIZE) {
            let entry = IndexEntry::from_record(record).ok_or(MetaFsError::BadIndex)?;
            last_object_id = last_object_id.max(entry.id().low);
            if validate_metadata(&entry.core) {
                index.push(entry);
            } else {
                warn!("metafs: dropping object {} with a bad checksum", entry.id());
            }
        }
        let views = bytes[views_at..]
            .chunks_exact(VIEW_RECORD_SIZE)
            .map(ViewDefinition::from_record)
            .collect::<Option<Vec<_>>>()
            .ok_or(MetaFsError::BadIndex)?;

        self.index = index;
        self.views = views;
        self.last_object_id = last_object_id;
        self.last_sync = read_u64(&bytes, 16);
        Ok(())
    }

    pub fn generate_object_id(&mut self) -> ObjectId {
        self.last_object_id += 1;
        ObjectId::new(0, self.last_object_id)
    }

    fn position(&self, id: ObjectId) -> Result<usize, MetaFsError> {
        self.index
            .iter()
            .position(|e| e.id() == id)
            .ok_or(MetaFsError::ObjectNotFound)
    }

    fn entry(&self, id: ObjectId) -> Result<&IndexEntry, MetaFsError> {
        self.position(id).map(|i| &self.index[i])
    }

    fn entry_mut(&mut self, id: ObjectId) -> Result<&mut IndexEntry, MetaFsError> {
        let i = self.position(id)?;
        Ok(&mut self.index[i])
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.position(id).is_ok()
    }

    pub fn object_create(&mut self, object_type: ObjectType) -> Result<ObjectId, MetaFsError> {
        if self.index.len() >= MAX_OBJECTS {
            warn!("metafs: object limit reached");
            return Err(MetaFsError::IndexFull);
        }
        let id = self.generate_object_id();
        self.index.push(IndexEntry::new(id, object_type));
        debug!("metafs: created {} object {}", object_type, id);
        Ok(id)
    }

    /// Drops the object from the index and removes its data file. Link
    /// files that name it are left behind and resolve as dangling.
    pub fn object_delete(&mut self, id: ObjectId) -> Result<(), MetaFsError> {
        let i = self.position(id)?;
        match self.volume.remove_file(&data_path(id)) {
            Ok(()) | Err(FsError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        self.index.remove(i);
        debug!("metafs: deleted object {}", id);
        Ok(())
    }

    pub fn object_open(&self, id: ObjectId) -> Result<ObjectHandle, MetaFsError> {
        let metadata = self.metadata_get(id)?;
        debug!("metafs: opened object {}", id);
        Ok(ObjectHandle {
            id,
            is_open: true,
            metadata,
        })
    }

    pub fn object_close(&self, handle: &mut ObjectHandle) -> Result<(), MetaFsError> {
        if !handle.is_open {
            return Err(MetaFsError::NotOpen);
        }
        handle.is_open = false;
        Ok(())
    }

    pub fn metadata_get(&self, id: ObjectId) -> Result<ObjectMetadata, MetaFsError> {
        let entry = self.entry(id)?;
        Ok(ObjectMetadata {
            core: entry.core,
            extended: entry.extended(),
        })
    }

    pub fn get_core_meta(&self, id: ObjectId) -> Result<CoreMetadata, MetaFsError> {
        self.entry(id).map(|e| e.core)
    }

    pub fn get_ext_meta(&self, id: ObjectId) -> Result<ExtendedMetadata, MetaFsError> {
        self.entry(id).map(IndexEntry::extended)
    }

    pub fn set_ext_meta(&mut self, id: ObjectId, ext: &ExtendedMetadata) -> Result<(), MetaFsError> {
        check_len(&ext.name, NAME_MAX)?;
        check_len(&ext.view, VIEW_MAX)?;
        check_len(&ext.tags, TAGS_MAX)?;
        let entry = self.entry_mut(id)?;
        entry.name.clone_from(&ext.name);
        entry.view.clone_from(&ext.view);
        entry.tags.clone_from(&ext.tags);
        Ok(())
    }

    /// Appends `tag` to the comma-separated tag list.
    pub fn add_tag(&mut self, id: ObjectId, tag: &str) -> Result<(), MetaFsError> {
        if tag.is_empty() || tag.contains(',') {
            return Err(MetaFsError::InvalidAttribute);
        }
        let entry = self.entry_mut(id)?;
        let separator = usize::from(!entry.tags.is_empty());
        if entry.tags.len() + separator + tag.len() > TAGS_MAX {
            return Err(MetaFsError::AttributeTooLong);
        }
        if separator == 1 {
            entry.tags.push(',');
        }
        entry.tags.push_str(tag);
        Ok(())
    }

    /// Sets the name. Names need not be unique; an empty name clears it.
    pub fn set_name(&mut self, id: ObjectId, name: &str) -> Result<(), MetaFsError> {
        check_len(name, NAME_MAX)?;
        self.entry_mut(id)?.name = String::from(name);
        Ok(())
    }

    pub fn get_name(&self, id: ObjectId) -> Option<&str> {
        self.entry(id).ok().and_then(IndexEntry::name)
    }

    pub fn set_view(&mut self, id: ObjectId, view: &str) -> Result<(), MetaFsError> {
        check_len(view, VIEW_MAX)?;
        self.entry_mut(id)?.view = String::from(view);
        Ok(())
    }

    pub fn get_view(&self, id: ObjectId) -> Option<&str> {
        self.entry(id).ok().and_then(IndexEntry::view)
    }

    pub fn set_extension(&mut self, id: ObjectId, extension: &str) -> Result<(), MetaFsError> {
        check_len(extension, EXTENSION_MAX)?;
        self.entry_mut(id)?.extension = String::from(extension);
        Ok(())
    }

    pub fn get_extension(&self, id: ObjectId) -> Option<&str> {
        self.entry(id).ok().and_then(IndexEntry::extension)
    }

    /// Changes the type and reseals the core metadata.
    pub fn set_type(&mut self, id: ObjectId, object_type: ObjectType) -> Result<(), MetaFsError> {
        self.entry_mut(id)?.core.set_type(object_type);
        Ok(())
    }

    /// A 16-hex-digit string is taken as an id without consulting the
    /// index; anything else resolves to the first object with that name.
    pub fn resolve_by_name(&self, text: &str) -> Option<ObjectId> {
        match Reference::parse(text) {
            Reference::ById(id) => Some(id),
            Reference::ByName(name) => self
                .index
                .iter()
                .find(|e| e.name() == Some(name))
                .map(IndexEntry::id),
        }
    }

    /// Up to `max_results` objects named `name`, in index order.
    pub fn query_by_name(&self, name: &str, max_results: usize) -> Vec<ObjectId> {
        self.index
            .iter()
            .filter(|e| e.name() == Some(name))
            .map(IndexEntry::id)
            .take(max_results)
            .collect()
    }

    /// Replaces the object's data. Returns the number of bytes stored.
    pub fn object_write_data(&mut self, id: ObjectId, data: &[u8]) -> Result<usize, MetaFsError> {
        self.position(id)?;
        let written = self.volume.write_new(&data_path(id), data)?;
        let entry = self.entry_mut(id)?;
        entry.core.size = written as u64;
        entry.core.seal();
        debug!("metafs: wrote {} bytes to {}", written, id);
        Ok(written)
    }

    /// Reads from the start of the object's data into `buf`.
    pub fn object_read_data(&mut self, id: ObjectId, buf: &mut [u8]) -> Result<usize, MetaFsError> {
        self.position(id)?;
        let fd = self.volume.open_file(&data_path(id))?;
        let result = self.volume.read_file(fd, buf);
        self.volume.close_file(fd)?;
        Ok(result?)
    }

    /// Writes the link `/views/<view>/<name>`, replacing an existing one.
    pub fn view_link_persistent(
        &mut self,
        view: &str,
        name: &str,
        id: ObjectId,
    ) -> Result<(), MetaFsError> {
        if view.is_empty() || view.len() > VIEW_NAME_MAX || view.contains('/') {
            return Err(MetaFsError::InvalidPath);
        }
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(MetaFsError::InvalidPath);
        }
        check_len(name, NAME_MAX)?;
        self.volume.create_dir_all(&format!("{}/{}", VIEWS_DIR, view))?;
        let path = link_path(view, name);
        let hex = id.to_hex();
        let written = self.volume.write_new(&path, hex.as_bytes())?;
        if written != hex.len() {
            return Err(FsError::NoSpace.into());
        }
        debug!("metafs: linked {} -> {}", path, hex);
        Ok(())
    }

    pub fn view_link(&mut self, view: &str, name: &str, id: ObjectId) -> Result<(), MetaFsError> {
        self.view_link_persistent(view, name, id)
    }

    pub fn view_unlink(&mut self, view: &str, name: &str) -> Result<(), MetaFsError> {
        let path = link_path(view, name);
        self.volume.remove_file(&path)?;
        debug!("metafs: unlinked {}", path);
        Ok(())
    }

    /// Reads the link file named by `/<view>/<name>`.
    pub fn path_resolve(&mut self, path: &str) -> Result<ObjectId, MetaFsError> {
        let (view, name) = split_object_path(path)?;
        let content = self.volume.read_to_vec(&link_path(view, name))?;
        let id = core::str::from_utf8(&content)
            .ok()
            .and_then(ObjectId::parse_hex)
            .ok_or(MetaFsError::InvalidLink)?;
        if !self.contains(id) {
            return Err(MetaFsError::DanglingLink(id));
        }
        Ok(id)
    }

    pub fn shell_resolve_path(
        &mut self,
        current_dir: &str,
        path: &str,
    ) -> Result<ObjectId, MetaFsError> {
        let normalized = normalize_path(current_dir, path)?;
        self.path_resolve(&normalized)
    }

    pub fn find_view(&self, name: &str) -> Option<&ViewDefinition> {
        self.views.iter().find(|v| v.name == name)
    }

    /// True for the root and for `/<view>` of a defined view.
    pub fn view_exists(&self, path: &str) -> bool {
        match path_get_view(path) {
            Ok("") => true,
            Ok(view) => self.find_view(view).is_some(),
            Err(_) => false,
        }
    }

    /// Lists the views at `/`, or the objects of one view at `/<view>`. An
    /// object belongs to a view if it is tagged with it or its type passes
    /// the view's filter.
    pub fn view_list(&mut self, path: &str) -> Result<Vec<ViewEntry>, MetaFsError> {
        let view_name = path_get_view(path)?;
        if view_name.is_empty() {
            return Ok(self
                .views
                .iter()
                .map(|v| ViewEntry {
                    name: v.name.clone(),
                    id: ObjectId::NULL,
                    object_type: ObjectType::Unknown,
                    size: 0,
                    created: 0,
                })
                .collect());
        }

        let view = self
            .find_view(view_name)
            .ok_or(MetaFsError::ViewNotFound)?
            .clone();
        let members: Vec<CoreMetadata> = self
            .index
            .iter()
            .filter(|e| e.view() == Some(view.name.as_str()) || view.accepts(e.object_type()))
            .take(VIEW_LIST_MAX)
            .map(|e| e.core)
            .collect();

        let links = self.view_links(&view.name);
        Ok(members
            .into_iter()
            .map(|core| ViewEntry {
                name: self.display_name(core.id, &links),
                id: core.id,
                object_type: core.object_type,
                size: core.size,
                created: core.created,
            })
            .collect())
    }

    /// Link names in one view with the ids they hold. Unreadable links are
    /// skipped.
    fn view_links(&mut self, view: &str) -> Vec<(String, ObjectId)> {
        let dir = format!("{}/{}", VIEWS_DIR, view);
        let Ok(entries) = self.volume.read_dir(&dir) else {
            return Vec::new();
        };
        entries
            .into_iter()
            .filter(|e| !e.metadata.is_dir)
            .filter_map(|e| {
                let content = self.volume.read_to_vec(&link_path(view, &e.name)).ok()?;
                let id = ObjectId::parse_hex(core::str::from_utf8(&content).ok()?)?;
                Some((e.name, id))
            })
            .collect()
    }

    fn display_name(&self, id: ObjectId, links: &[(String, ObjectId)]) -> String {
        if let Some((name, _)) = links.iter().find(|(_, target)| *target == id) {
            return name.clone();
        }
        match self.get_name(id) {
            Some(name) => String::from(name),
            None => format!("obj_{}", id.to_hex()),
        }
    }

    /// Display name of `id` within `view`: a link name pointing at it, else
    /// its name attribute, else `obj_<hex>`.
    pub fn object_get_name(&mut self, id: ObjectId, view: &str) -> String {
        let links = self.view_links(view);
        self.display_name(id, &links)
    }

    pub fn view_create(&mut self, name: &str, filter: ObjectType) -> Result<(), MetaFsError> {
        if name.is_empty() || name.contains('/') {
            return Err(MetaFsError::InvalidPath);
        }
        check_len(name, VIEW_NAME_MAX)?;
        if self.find_view(name).is_some() {
            return Err(MetaFsError::ViewExists);
        }
        if self.views.len() >= MAX_VIEWS {
            return Err(MetaFsError::ViewTableFull);
        }
        self.volume.create_dir_all(&format!("{}/{}", VIEWS_DIR, name))?;
        self.views
            .push(ViewDefinition::new(name, ViewKind::StaticDocuments, filter));
        info!("metafs: created view {}", name);
        self.sync()
    }

    fn create_system_object(
        &mut self,
        name: &str,
        extension: &str,
        view: &str,
    ) -> Result<ObjectId, MetaFsError> {
        let id = self.object_create(ObjectType::Data)?;
        self.set_name(id, name)?;
        self.set_extension(id, extension)?;
        self.set_view(id, view)?;
        Ok(id)
    }

    /// Registers the object database and the system state record as
    /// objects of the `kernel` view.
    pub fn import_system_files(&mut self) -> Result<(), MetaFsError> {
        self.create_system_object("objects", "db", SYSTEM_VIEWS[0])?;
        self.create_system_object("system", "state", SYSTEM_VIEWS[0])?;
        info!("metafs: imported 2 system files");
        Ok(())
    }
}

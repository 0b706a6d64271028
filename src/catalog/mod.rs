// Schema catalogue.
//
// The catalogue persists the engine's schema elements (node types, edge
// types, properties) through the buffer pool, as a singly-linked chain of
// catalogue pages starting at a well-known page id. Each page carries a
// small header and a packed array of fixed-size records. The catalogue is
// also the canonical exercise of the buffer-pool page protocol:
// pin / mutate / set_page_dirty / unpin, with alloc extending the chain.

use std::collections::BTreeMap;

use log::debug;

use crate::buffer::{BufferHandler, BufferPool};
use crate::common::{PageId, INVALID_PAGE_ID};
use crate::error::{Result, StoreError};

/// First catalogue page. Page 0 belongs to the allocation bitmap, so the
/// first page a fresh pool allocates is this one.
pub const CATALOG_ENTRY_PAGE: PageId = 1;

/// Element names are stored inline, NUL-padded to this size.
pub const MAX_NAME_LENGTH: usize = 64;

pub type TypeId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Int,
    Long,
    Float,
    Double,
    String,
}

/// The low-level structure a schema element is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureKind {
    Table,
    Index,
    Csr,
    /// No dedicated structure; the element is just its record.
    NoStruct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementInfo {
    Node { type_id: TypeId },
    Edge { type_id: TypeId },
    Property { kind: PropertyKind },
}

#[derive(Debug, Clone)]
pub struct SchemaElement {
    pub name: String,
    pub info: ElementInfo,
    pub structure: StructureKind,
    /// Entry point of the element's structure, `INVALID_PAGE_ID` if none.
    pub entry_page: PageId,
}

impl SchemaElement {
    /// Type id for node and edge elements.
    pub fn type_id(&self) -> TypeId {
        match self.info {
            ElementInfo::Node { type_id } | ElementInfo::Edge { type_id } => type_id,
            ElementInfo::Property { .. } => panic!("properties have no type id"),
        }
    }
}

// On-page layout. Records are fixed size so a page holds
// `(page_size - PAGE_HEADER_SIZE) / RECORD_SIZE` of them.
//
//   header:  num_elements u32 | pad u32 | next_page u64
//   record:  kind u8 | name [u8; 64] | aux u16 | structure u16 | entry u64
//            (padded to RECORD_SIZE)
pub(crate) const PAGE_HEADER_SIZE: usize = 16;
pub(crate) const RECORD_SIZE: usize = 80;

const KIND_NODE: u8 = 0;
const KIND_EDGE: u8 = 1;
const KIND_PROPERTY: u8 = 2;

struct PageHeader {
    num_elements: u32,
    next_page: PageId,
}

fn decode_header(bytes: &[u8]) -> PageHeader {
    PageHeader {
        num_elements: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        next_page: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
    }
}

fn encode_header(header: &PageHeader, bytes: &mut [u8]) {
    bytes[0..4].copy_from_slice(&header.num_elements.to_le_bytes());
    bytes[4..8].fill(0);
    bytes[8..16].copy_from_slice(&header.next_page.to_le_bytes());
}

fn encode_record(element: &SchemaElement, bytes: &mut [u8]) {
    debug_assert_eq!(bytes.len(), RECORD_SIZE);
    bytes.fill(0);
    let (kind, aux) = match element.info {
        ElementInfo::Node { type_id } => (KIND_NODE, type_id),
        ElementInfo::Edge { type_id } => (KIND_EDGE, type_id),
        ElementInfo::Property { kind } => (KIND_PROPERTY, kind as u16),
    };
    bytes[0] = kind;
    bytes[1..1 + element.name.len()].copy_from_slice(element.name.as_bytes());
    bytes[65..67].copy_from_slice(&aux.to_le_bytes());
    bytes[67..69].copy_from_slice(&(element.structure as u16).to_le_bytes());
    bytes[69..77].copy_from_slice(&element.entry_page.to_le_bytes());
}

fn decode_record(page_id: PageId, bytes: &[u8]) -> Result<SchemaElement> {
    debug_assert_eq!(bytes.len(), RECORD_SIZE);
    let name_bytes = &bytes[1..1 + MAX_NAME_LENGTH];
    let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LENGTH);
    let name = std::str::from_utf8(&name_bytes[..name_len])
        .map_err(|_| StoreError::SchemaPageCorrupted(page_id))?
        .to_string();

    let aux = u16::from_le_bytes(bytes[65..67].try_into().unwrap());
    let info = match bytes[0] {
        KIND_NODE => ElementInfo::Node { type_id: aux },
        KIND_EDGE => ElementInfo::Edge { type_id: aux },
        KIND_PROPERTY => ElementInfo::Property {
            kind: match aux {
                0 => PropertyKind::Int,
                1 => PropertyKind::Long,
                2 => PropertyKind::Float,
                3 => PropertyKind::Double,
                4 => PropertyKind::String,
                _ => return Err(StoreError::SchemaPageCorrupted(page_id)),
            },
        },
        _ => return Err(StoreError::SchemaPageCorrupted(page_id)),
    };
    let structure = match u16::from_le_bytes(bytes[67..69].try_into().unwrap()) {
        0 => StructureKind::Table,
        1 => StructureKind::Index,
        2 => StructureKind::Csr,
        3 => StructureKind::NoStruct,
        _ => return Err(StoreError::SchemaPageCorrupted(page_id)),
    };
    let entry_page = u64::from_le_bytes(bytes[69..77].try_into().unwrap());

    Ok(SchemaElement {
        name,
        info,
        structure,
        entry_page,
    })
}

/// In-memory schema with explicit load/persist against the buffer pool.
pub struct SchemaCatalog<'a> {
    pool: &'a BufferPool,
    next_type_id: TypeId,
    /// Pages of the catalogue chain, in chain order.
    pages: Vec<PageId>,
    nodes: BTreeMap<String, SchemaElement>,
    edges: BTreeMap<String, SchemaElement>,
    properties: BTreeMap<String, SchemaElement>,
}

impl<'a> SchemaCatalog<'a> {
    pub fn new(pool: &'a BufferPool) -> Self {
        Self {
            pool,
            next_type_id: 0,
            pages: Vec::new(),
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    fn elements_per_page(&self) -> Result<usize> {
        let stats = self.pool.get_statistics()?;
        Ok((stats.page_size as usize - PAGE_HEADER_SIZE) / RECORD_SIZE)
    }

    /// Loads the schema from the catalogue chain, replacing the in-memory
    /// state. The entry page must exist and carry a valid header.
    pub fn load(&mut self) -> Result<()> {
        let capacity = self.elements_per_page()?;
        self.nodes.clear();
        self.edges.clear();
        self.properties.clear();
        self.pages.clear();

        let mut next = CATALOG_ENTRY_PAGE;
        while next != INVALID_PAGE_ID {
            let page_id = next;
            self.pages.push(page_id);
            let handler = self.pool.pin(page_id, true)?;
            let parsed = self.read_page(page_id, &handler, capacity);
            self.pool.unpin(&handler)?;
            next = parsed?;
        }

        // The counter is not persisted; recover it from the stored ids.
        self.next_type_id = self
            .nodes
            .values()
            .chain(self.edges.values())
            .map(|e| e.type_id() + 1)
            .max()
            .unwrap_or(0);

        debug!(
            "schema loaded: {} nodes, {} edges, {} properties over {} pages",
            self.nodes.len(),
            self.edges.len(),
            self.properties.len(),
            self.pages.len()
        );
        Ok(())
    }

    fn read_page(
        &mut self,
        page_id: PageId,
        handler: &BufferHandler,
        capacity: usize,
    ) -> Result<PageId> {
        let data = handler.data();
        let header = decode_header(data);
        if header.num_elements as usize > capacity {
            return Err(StoreError::SchemaPageCorrupted(page_id));
        }
        for i in 0..header.num_elements as usize {
            let offset = PAGE_HEADER_SIZE + i * RECORD_SIZE;
            let element = decode_record(page_id, &data[offset..offset + RECORD_SIZE])?;
            let slot = match element.info {
                ElementInfo::Node { .. } => &mut self.nodes,
                ElementInfo::Edge { .. } => &mut self.edges,
                ElementInfo::Property { .. } => &mut self.properties,
            };
            slot.insert(element.name.clone(), element);
        }
        Ok(header.next_page)
    }

    /// Streams every element back into the chain, allocating further
    /// catalogue pages only when the chain is too short. Catalogue pages
    /// are never freed.
    pub fn persist(&mut self) -> Result<()> {
        let capacity = self.elements_per_page()?;
        let elements: Vec<&SchemaElement> = self
            .nodes
            .values()
            .chain(self.edges.values())
            .chain(self.properties.values())
            .collect();
        let pages_needed = elements.len().div_ceil(capacity).max(1);

        if self.pages.is_empty() {
            self.pages.push(CATALOG_ENTRY_PAGE);
        }
        while self.pages.len() < pages_needed {
            let handler = self.pool.alloc()?;
            self.pages.push(handler.page_id());
            self.pool.unpin(&handler)?;
        }

        let mut chunks: Vec<&[&SchemaElement]> = elements.chunks(capacity).collect();
        if chunks.is_empty() {
            // An empty schema still rewrites the entry page's header.
            chunks.push(&[]);
        }
        for (idx, chunk) in chunks.into_iter().enumerate() {
            let page_id = self.pages[idx];
            let next_page = if (idx + 1) * capacity < elements.len() {
                self.pages[idx + 1]
            } else {
                INVALID_PAGE_ID
            };

            let mut handler = self.pool.pin(page_id, true)?;
            let data = handler.data_mut();
            encode_header(
                &PageHeader {
                    num_elements: chunk.len() as u32,
                    next_page,
                },
                data,
            );
            for (i, element) in chunk.iter().enumerate() {
                let offset = PAGE_HEADER_SIZE + i * RECORD_SIZE;
                encode_record(element, &mut data[offset..offset + RECORD_SIZE]);
            }
            self.pool.set_page_dirty(page_id)?;
            self.pool.unpin(&handler)?;
        }

        debug!("schema persisted: {} elements over {pages_needed} pages", elements.len());
        Ok(())
    }

    pub fn new_node_type(&mut self, name: &str) -> Result<TypeId> {
        validate_name(name)?;
        if self.nodes.contains_key(name) {
            return Err(StoreError::SchemaTypeAlreadyExists(name.to_string()));
        }
        let type_id = self.next_type_id;
        self.next_type_id += 1;
        self.nodes.insert(
            name.to_string(),
            SchemaElement {
                name: name.to_string(),
                info: ElementInfo::Node { type_id },
                structure: StructureKind::NoStruct,
                entry_page: INVALID_PAGE_ID,
            },
        );
        Ok(type_id)
    }

    pub fn get_node_type(&self, name: &str) -> Result<&SchemaElement> {
        self.nodes
            .get(name)
            .ok_or_else(|| StoreError::SchemaTypeNotFound(name.to_string()))
    }

    pub fn new_edge_type(&mut self, name: &str) -> Result<TypeId> {
        validate_name(name)?;
        if self.edges.contains_key(name) {
            return Err(StoreError::SchemaTypeAlreadyExists(name.to_string()));
        }
        let type_id = self.next_type_id;
        self.next_type_id += 1;
        self.edges.insert(
            name.to_string(),
            SchemaElement {
                name: name.to_string(),
                info: ElementInfo::Edge { type_id },
                structure: StructureKind::NoStruct,
                entry_page: INVALID_PAGE_ID,
            },
        );
        Ok(type_id)
    }

    pub fn get_edge_type(&self, name: &str) -> Result<&SchemaElement> {
        self.edges
            .get(name)
            .ok_or_else(|| StoreError::SchemaTypeNotFound(name.to_string()))
    }

    pub fn new_property(&mut self, name: &str, kind: PropertyKind) -> Result<()> {
        validate_name(name)?;
        if self.properties.contains_key(name) {
            return Err(StoreError::SchemaTypeAlreadyExists(name.to_string()));
        }
        self.properties.insert(
            name.to_string(),
            SchemaElement {
                name: name.to_string(),
                info: ElementInfo::Property { kind },
                structure: StructureKind::NoStruct,
                entry_page: INVALID_PAGE_ID,
            },
        );
        Ok(())
    }

    pub fn get_property(&self, name: &str) -> Result<&SchemaElement> {
        self.properties
            .get(name)
            .ok_or_else(|| StoreError::SchemaTypeNotFound(name.to_string()))
    }

    pub fn num_elements(&self) -> usize {
        self.nodes.len() + self.edges.len() + self.properties.len()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.len() >= MAX_NAME_LENGTH - 1 {
        return Err(StoreError::SchemaNameTooLong(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, info: ElementInfo) -> SchemaElement {
        SchemaElement {
            name: name.to_string(),
            info,
            structure: StructureKind::NoStruct,
            entry_page: INVALID_PAGE_ID,
        }
    }

    #[test]
    fn record_codec_round_trips() {
        let elements = [
            sample("person", ElementInfo::Node { type_id: 7 }),
            sample("knows", ElementInfo::Edge { type_id: 8 }),
            sample("age", ElementInfo::Property { kind: PropertyKind::Int }),
        ];
        for element in &elements {
            let mut bytes = [0u8; RECORD_SIZE];
            encode_record(element, &mut bytes);
            let decoded = decode_record(1, &bytes).unwrap();
            assert_eq!(decoded.name, element.name);
            assert_eq!(decoded.info, element.info);
            assert_eq!(decoded.structure, element.structure);
            assert_eq!(decoded.entry_page, element.entry_page);
        }
    }

    #[test]
    fn bogus_kind_is_corruption() {
        let mut bytes = [0u8; RECORD_SIZE];
        encode_record(&sample("x", ElementInfo::Node { type_id: 0 }), &mut bytes);
        bytes[0] = 9;
        assert!(matches!(
            decode_record(3, &bytes),
            Err(StoreError::SchemaPageCorrupted(3))
        ));
    }

    #[test]
    fn header_codec_round_trips() {
        let mut bytes = [0u8; PAGE_HEADER_SIZE];
        encode_header(
            &PageHeader {
                num_elements: 42,
                next_page: INVALID_PAGE_ID,
            },
            &mut bytes,
        );
        let header = decode_header(&bytes);
        assert_eq!(header.num_elements, 42);
        assert_eq!(header.next_page, INVALID_PAGE_ID);
    }
}

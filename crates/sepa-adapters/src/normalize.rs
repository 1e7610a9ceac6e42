//! Retailer field mappings and per-row validation.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::ControlFlow;
use std::ops::RangeInclusive;

use csv::{ByteRecord, ReaderBuilder};
use sepa_core::{NormalizedRow, Price, RawRecord, RetailerGroup, StoreRecord};
use serde::Serialize;
use thiserror::Error;

use crate::extract::RawFile;

/// EAN-8 up to GTIN-14.
pub const BARCODE_LENGTHS: RangeInclusive<usize> = 8..=14;

const CANDIDATE_DELIMITERS: [u8; 4] = [b'|', b';', b',', b'\t'];

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("cannot open {file}: {source}")]
    Open {
        file: String,
        #[source]
        source: std::io::Error,
    },
    #[error("reading {file}: {source}")]
    Csv {
        file: String,
        #[source]
        source: csv::Error,
    },
    #[error("{file} has no {column} column")]
    MissingColumn { file: String, column: String },
    #[error("{file} is not a record file for mapping {mapping}")]
    IgnoredFile { file: String, mapping: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    Prices,
    Stores,
    Ignored,
}

/// Column layout of one retailer group.
///
/// Every field lists accepted header names in preference order. Composite keys
/// list one alias group per component; component values are joined with `-`.
#[derive(Debug, Clone)]
pub struct FieldMapping {
    pub name: &'static str,
    /// `None` picks the most frequent candidate delimiter on the header line.
    pub delimiter: Option<u8>,
    pub store_key: Vec<Vec<&'static str>>,
    /// Falls back to the store id when absent.
    pub chain_key: Vec<Vec<&'static str>>,
    pub store_name: Vec<&'static str>,
    pub barcode: Vec<&'static str>,
    pub product_name: Vec<&'static str>,
    pub brand: Vec<&'static str>,
    pub price: Vec<&'static str>,
    pub store_files: Vec<&'static str>,
    pub ignored_files: Vec<&'static str>,
    /// `(chain_id, published name, display name)`
    pub store_name_overrides: Vec<(&'static str, &'static str, &'static str)>,
    /// Lowercase prefixes of single-field footer lines that are not records.
    pub trailer_prefixes: Vec<&'static str>,
}

impl FieldMapping {
    /// Pipe-delimited layout of the national SEPA dataset. A store is a
    /// company + banner pair; names come from each container's `comercio.csv`.
    pub fn sepa() -> Self {
        Self {
            name: RetailerGroup::SEPA,
            delimiter: Some(b'|'),
            store_key: vec![vec!["id_comercio"], vec!["id_bandera"]],
            chain_key: vec![vec!["id_comercio"]],
            store_name: vec!["comercio_bandera_nombre", "comercio_razon_social"],
            barcode: vec!["id_producto"],
            product_name: vec!["productos_descripcion"],
            brand: vec!["productos_marca"],
            price: vec!["productos_precio_lista"],
            store_files: vec!["comercio.csv"],
            ignored_files: vec!["sucursales.csv"],
            store_name_overrides: vec![
                ("10", "Express", "Carrefour Express"),
                ("10", "Market", "Carrefour Market"),
            ],
            trailer_prefixes: vec!["última actualización", "ultima actualizacion"],
        }
    }

    /// Column-name based fallback for groups without a dedicated entry.
    pub fn generic() -> Self {
        Self {
            name: RetailerGroup::GENERIC,
            delimiter: None,
            store_key: vec![vec!["store_id", "id_comercio", "comercio_id", "id_tienda"]],
            chain_key: vec![vec!["chain_id", "id_cadena", "banner_id"]],
            store_name: vec!["store_name", "nombre_comercio", "comercio_nombre"],
            barcode: vec!["barcode", "ean", "gtin", "codigo_barras", "id_producto"],
            product_name: vec!["product_name", "descripcion", "description", "nombre_producto"],
            brand: vec!["brand", "marca"],
            price: vec!["price", "precio", "price_text", "precio_lista"],
            store_files: vec!["stores.csv", "comercios.csv"],
            ignored_files: vec![],
            store_name_overrides: vec![],
            trailer_prefixes: vec![],
        }
    }

    pub fn role(&self, file_name: &str) -> FileRole {
        let file_name = file_name.to_ascii_lowercase();
        if self.store_files.iter().any(|f| *f == file_name) {
            FileRole::Stores
        } else if self.ignored_files.iter().any(|f| *f == file_name) {
            FileRole::Ignored
        } else {
            FileRole::Prices
        }
    }

    pub fn is_trailer(&self, record: &ByteRecord) -> bool {
        if self.trailer_prefixes.is_empty() || record.len() != 1 {
            return false;
        }
        let line = String::from_utf8_lossy(&record[0]).trim().to_lowercase();
        self.trailer_prefixes.iter().any(|prefix| line.starts_with(prefix))
    }

    pub fn display_store_name(&self, chain_id: &str, name: String) -> String {
        self.store_name_overrides
            .iter()
            .find(|(chain, published, _)| *chain == chain_id && published.eq_ignore_ascii_case(&name))
            .map(|(_, _, display)| display.to_string())
            .unwrap_or(name)
    }
}

/// Explicit retailer-group → mapping table with a generic fallback.
#[derive(Debug, Clone)]
pub struct MappingTable {
    mappings: BTreeMap<RetailerGroup, FieldMapping>,
    fallback: FieldMapping,
}

impl Default for MappingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl MappingTable {
    pub fn builtin() -> Self {
        let mut table = Self {
            mappings: BTreeMap::new(),
            fallback: FieldMapping::generic(),
        };
        table.insert(RetailerGroup::sepa(), FieldMapping::sepa());
        table
    }

    pub fn insert(&mut self, group: RetailerGroup, mapping: FieldMapping) {
        self.mappings.insert(group, mapping);
    }

    pub fn mapping_for(&self, group: &RetailerGroup) -> &FieldMapping {
        self.mappings.get(group).unwrap_or(&self.fallback)
    }

    pub fn groups(&self) -> impl Iterator<Item = &RetailerGroup> {
        self.mappings.keys()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingStore,
    MissingBarcode,
    InvalidBarcode,
    MissingPrice,
    InvalidPrice,
    Unreadable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Accepted(NormalizedRow),
    Rejected(RejectReason),
    /// Valid row for a chain outside the allow-list.
    Filtered,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeStats {
    pub rows_read: usize,
    pub accepted: usize,
    pub filtered: usize,
    pub rejected: BTreeMap<RejectReason, usize>,
}

impl NormalizeStats {
    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }

    pub fn absorb(&mut self, outcome: &RowOutcome) {
        self.rows_read += 1;
        match outcome {
            RowOutcome::Accepted(_) => self.accepted += 1,
            RowOutcome::Rejected(reason) => *self.rejected.entry(*reason).or_default() += 1,
            RowOutcome::Filtered => self.filtered += 1,
        }
    }

    pub fn merge(&mut self, other: &NormalizeStats) {
        self.rows_read += other.rows_read;
        self.accepted += other.accepted;
        self.filtered += other.filtered;
        for (reason, count) in &other.rejected {
            *self.rejected.entry(*reason).or_default() += count;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub role: FileRole,
    pub stats: NormalizeStats,
    /// The sink stopped the read before the end of the file.
    pub interrupted: bool,
}

pub fn is_plausible_barcode(value: &str) -> bool {
    BARCODE_LENGTHS.contains(&value.len()) && value.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    table: MappingTable,
    allowed_chains: BTreeSet<String>,
}

impl Normalizer {
    pub fn new(table: MappingTable, allowed_chains: BTreeSet<String>) -> Self {
        Self {
            table,
            allowed_chains,
        }
    }

    pub fn table(&self) -> &MappingTable {
        &self.table
    }

    pub fn role_of(&self, file: &RawFile) -> FileRole {
        self.table
            .mapping_for(&file.retailer_group)
            .role(&file.file_name())
    }

    /// Open a lazy record stream over `file`. Calling again re-reads the file.
    pub fn records(&self, file: &RawFile) -> Result<RecordReader<'_>, NormalizeError> {
        let mapping = self.table.mapping_for(&file.retailer_group);
        let role = mapping.role(&file.file_name());
        let label = file.label();
        if role == FileRole::Ignored {
            return Err(NormalizeError::IgnoredFile {
                file: label,
                mapping: mapping.name.to_string(),
            });
        }

        let delimiter = match mapping.delimiter {
            Some(delimiter) => delimiter,
            None => sniff_delimiter(file, &label)?,
        };
        let handle = File::open(&file.path).map_err(|source| NormalizeError::Open {
            file: label.clone(),
            source,
        })?;
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(delimiter)
            .trim(csv::Trim::All)
            .from_reader(handle);

        let headers: Vec<String> = reader
            .byte_headers()
            .map_err(|source| NormalizeError::Csv {
                file: label.clone(),
                source,
            })?
            .iter()
            .map(|h| {
                String::from_utf8_lossy(h)
                    .trim_start_matches('\u{feff}')
                    .trim()
                    .to_ascii_lowercase()
            })
            .collect();
        let columns = Columns::resolve(&headers, mapping, role, &label)?;

        Ok(RecordReader {
            reader,
            record: ByteRecord::new(),
            columns,
            mapping,
            role,
            allowed_chains: &self.allowed_chains,
            label,
            done: false,
        })
    }

    /// Stream a whole file into `sink`, one accepted row at a time, counting
    /// the rest. Nothing is retained here; the sink decides what to keep.
    pub fn normalize_file<F>(&self, file: &RawFile, mut sink: F) -> Result<FileOutcome, NormalizeError>
    where
        F: FnMut(NormalizedRow) -> ControlFlow<()>,
    {
        let role = self.role_of(file);
        let mut outcome = FileOutcome {
            role,
            stats: NormalizeStats::default(),
            interrupted: false,
        };
        if role == FileRole::Ignored {
            return Ok(outcome);
        }

        for row in self.records(file)? {
            let row = row?;
            outcome.stats.absorb(&row);
            if let RowOutcome::Accepted(accepted) = row {
                if sink(accepted).is_break() {
                    outcome.interrupted = true;
                    break;
                }
            }
        }
        Ok(outcome)
    }
}

fn sniff_delimiter(file: &RawFile, label: &str) -> Result<u8, NormalizeError> {
    let handle = File::open(&file.path).map_err(|source| NormalizeError::Open {
        file: label.to_string(),
        source,
    })?;
    let mut first_line = Vec::new();
    BufReader::new(handle)
        .read_until(b'\n', &mut first_line)
        .map_err(|source| NormalizeError::Open {
            file: label.to_string(),
            source,
        })?;
    let best = CANDIDATE_DELIMITERS
        .iter()
        .map(|d| (first_line.iter().filter(|b| *b == d).count(), *d))
        .filter(|(count, _)| *count > 0)
        .max_by_key(|(count, _)| *count)
        .map(|(_, d)| d);
    Ok(best.unwrap_or(b','))
}

#[derive(Debug)]
struct Columns {
    store_key: Vec<usize>,
    chain_key: Option<Vec<usize>>,
    store_name: Vec<usize>,
    barcode: Option<usize>,
    product_name: Vec<usize>,
    brand: Vec<usize>,
    price: Option<usize>,
}

impl Columns {
    fn resolve(
        headers: &[String],
        mapping: &FieldMapping,
        role: FileRole,
        label: &str,
    ) -> Result<Self, NormalizeError> {
        let find = |aliases: &[&str]| {
            aliases
                .iter()
                .find_map(|alias| headers.iter().position(|h| h.eq_ignore_ascii_case(alias)))
        };
        let find_all = |aliases: &[&str]| -> Vec<usize> {
            aliases
                .iter()
                .filter_map(|alias| headers.iter().position(|h| h.eq_ignore_ascii_case(alias)))
                .collect()
        };
        let required = |aliases: &[&str]| {
            find(aliases).ok_or_else(|| NormalizeError::MissingColumn {
                file: label.to_string(),
                column: aliases.first().copied().unwrap_or("?").to_string(),
            })
        };

        let store_key = mapping
            .store_key
            .iter()
            .map(|aliases| required(aliases.as_slice()))
            .collect::<Result<Vec<_>, _>>()?;
        let chain_key = mapping
            .chain_key
            .iter()
            .map(|aliases| find(aliases.as_slice()))
            .collect::<Option<Vec<_>>>()
            .filter(|key| !key.is_empty());

        let (barcode, price) = match role {
            FileRole::Prices => (
                Some(required(mapping.barcode.as_slice())?),
                Some(required(mapping.price.as_slice())?),
            ),
            _ => (None, None),
        };

        Ok(Self {
            store_key,
            chain_key,
            store_name: find_all(mapping.store_name.as_slice()),
            barcode,
            product_name: find_all(mapping.product_name.as_slice()),
            brand: find_all(mapping.brand.as_slice()),
            price,
        })
    }
}

/// Lazy row stream over one raw file.
pub struct RecordReader<'a> {
    reader: csv::Reader<File>,
    record: ByteRecord,
    columns: Columns,
    mapping: &'a FieldMapping,
    role: FileRole,
    allowed_chains: &'a BTreeSet<String>,
    label: String,
    done: bool,
}

impl RecordReader<'_> {
    fn value(&self, idx: usize) -> Option<String> {
        self.record
            .get(idx)
            .map(|raw| String::from_utf8_lossy(raw).trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn first_value(&self, indices: &[usize]) -> Option<String> {
        indices.iter().find_map(|idx| self.value(*idx))
    }

    fn composite(&self, indices: &[usize]) -> Option<String> {
        let parts = indices
            .iter()
            .map(|idx| self.value(*idx))
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("-"))
    }

    fn chain_allowed(&self, chain_id: &str) -> bool {
        self.allowed_chains.is_empty() || self.allowed_chains.contains(chain_id)
    }

    fn classify(&self) -> RowOutcome {
        let Some(store_id) = self.composite(&self.columns.store_key) else {
            return RowOutcome::Rejected(RejectReason::MissingStore);
        };
        let chain_id = self
            .columns
            .chain_key
            .as_deref()
            .and_then(|key| self.composite(key))
            .unwrap_or_else(|| store_id.clone());
        if !self.chain_allowed(&chain_id) {
            return RowOutcome::Filtered;
        }
        let store_name = self
            .first_value(&self.columns.store_name)
            .map(|name| self.mapping.display_store_name(&chain_id, name));

        if self.role == FileRole::Stores {
            return RowOutcome::Accepted(NormalizedRow::Store(StoreRecord {
                store_id,
                chain_id,
                name: store_name,
            }));
        }

        let Some(barcode) = self.columns.barcode.and_then(|idx| self.value(idx)) else {
            return RowOutcome::Rejected(RejectReason::MissingBarcode);
        };
        let barcode: String = barcode.chars().filter(|c| !c.is_whitespace()).collect();
        if !is_plausible_barcode(&barcode) {
            return RowOutcome::Rejected(RejectReason::InvalidBarcode);
        }
        let Some(price_text) = self.columns.price.and_then(|idx| self.value(idx)) else {
            return RowOutcome::Rejected(RejectReason::MissingPrice);
        };
        let Ok(price) = Price::parse(&price_text) else {
            return RowOutcome::Rejected(RejectReason::InvalidPrice);
        };

        RowOutcome::Accepted(NormalizedRow::Price(RawRecord {
            store_id,
            chain_id,
            store_name,
            barcode,
            product_name: self.first_value(&self.columns.product_name),
            brand: self.first_value(&self.columns.brand),
            price_text,
            price,
        }))
    }
}

impl Iterator for RecordReader<'_> {
    type Item = Result<RowOutcome, NormalizeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let read = loop {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(true) if self.mapping.is_trailer(&self.record) => continue,
                other => break other,
            }
        };
        match read {
            Ok(true) => Some(Ok(self.classify())),
            Ok(false) => {
                self.done = true;
                None
            }
            Err(err) if matches!(err.kind(), csv::ErrorKind::Io(_)) => {
                self.done = true;
                Some(Err(NormalizeError::Csv {
                    file: self.label.clone(),
                    source: err,
                }))
            }
            Err(_) => Some(Ok(RowOutcome::Rejected(RejectReason::Unreadable))),
        }
    }
}

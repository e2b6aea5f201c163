//! Streaming PubMed XML transformer
//!
//! Converts a decompressed citation archive into a lazy, forward-only
//! sequence of operation chunks. One top-level `<MedlineCitation>` or
//! `<DeleteCitation>` element is held in memory at a time; its tree is
//! released as soon as the element has been folded into the current chunk,
//! so memory stays bounded regardless of archive size.
//!
//! Malformed fields never abort a file: a citation without a parseable PMID
//! is skipped, an invalid date becomes NULL, an author without a family or
//! collective name contributes nothing. Only structural failures (corrupt
//! stream, truncated document) surface as errors.

pub mod tree;

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::NaiveDate;
use flate2::read::GzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::model::{
    Author, Citation, CitationAuthor, CitationDocument, CitationMeshTerm, Journal, LoadMode,
    MeshTerm,
};
pub use tree::XmlNode;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed XML near byte {position}: {source}")]
    Xml {
        position: u64,
        source: quick_xml::Error,
    },

    #[error("Unexpected end of stream inside <{element}>")]
    UnexpectedEof { element: String },
}

// ============================================================================
// Operation Chunks
// ============================================================================

/// Accumulated upsert records, grouped by destination table
#[derive(Debug, Default)]
pub struct UpsertChunk {
    pub documents: Vec<CitationDocument>,
    pub journals: Vec<Journal>,
    pub citations: Vec<Citation>,
    pub authors: Vec<Author>,
    pub citation_authors: Vec<CitationAuthor>,
    pub mesh_terms: Vec<MeshTerm>,
    pub citation_mesh_terms: Vec<CitationMeshTerm>,
    records: usize,
}

impl UpsertChunk {
    /// Number of source citations folded into this chunk
    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }
}

/// One unit of work yielded by the stream
///
/// Deletions are applied against final tables as their chunk is emitted,
/// while upserts land at merge time; a same-file upsert+delete collision
/// therefore resolves at chunk granularity, not strict document order.
#[derive(Debug)]
pub enum OperationChunk {
    Upsert(UpsertChunk),
    Delete(Vec<i32>),
}

// ============================================================================
// Citation Stream
// ============================================================================

/// Lazy, single-pass iterator over an archive's operation chunks
///
/// Not restartable: reparsing requires a fresh stream.
pub struct CitationStream<R: BufRead> {
    reader: Reader<R>,
    mode: LoadMode,
    chunk_size: usize,
    upserts: UpsertChunk,
    deletions: Vec<i32>,
    ready: VecDeque<OperationChunk>,
    finished: bool,
}

impl CitationStream<BufReader<GzDecoder<File>>> {
    /// Open a gzipped archive file for streaming
    pub fn from_gzip_path(
        path: &Path,
        mode: LoadMode,
        chunk_size: usize,
    ) -> Result<Self, ParserError> {
        let file = File::open(path)?;
        Ok(Self::from_reader(
            BufReader::new(GzDecoder::new(file)),
            mode,
            chunk_size,
        ))
    }
}

impl<R: BufRead> CitationStream<R> {
    /// Stream from an already-decompressed XML source
    pub fn from_reader(reader: R, mode: LoadMode, chunk_size: usize) -> Self {
        Self {
            reader: Reader::from_reader(reader),
            mode,
            chunk_size: chunk_size.max(1),
            upserts: UpsertChunk::default(),
            deletions: Vec::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    /// Read events until at least one chunk is ready or the stream ends
    fn pump(&mut self) -> Result<(), ParserError> {
        let mut buf = Vec::new();

        while self.ready.is_empty() && !self.finished {
            buf.clear();
            let event = self.read_event(&mut buf)?;
            match event {
                Event::Start(start) => match start.local_name().as_ref() {
                    b"MedlineCitation" => {
                        let node = self.read_subtree(&start)?;
                        self.process_citation(node);
                    },
                    b"DeleteCitation" => {
                        let node = self.read_subtree(&start)?;
                        self.collect_deletions(&node);
                    },
                    _ => {},
                },
                Event::Eof => self.flush_remaining(),
                _ => {},
            }
        }

        Ok(())
    }

    fn read_event<'b>(&mut self, buf: &'b mut Vec<u8>) -> Result<Event<'b>, ParserError> {
        let position = self.reader.buffer_position();
        self.reader
            .read_event_into(buf)
            .map_err(|source| ParserError::Xml {
                position: position as u64,
                source,
            })
    }

    /// Consume events up to the matching end tag, building an element tree
    fn read_subtree(&mut self, root_start: &BytesStart<'_>) -> Result<XmlNode, ParserError> {
        let root_tag = local_name_string(root_start);
        let mut root = node_from_start(root_start)
            .map_err(|source| self.xml_error(source))?;
        let mut stack: Vec<(String, XmlNode)> = Vec::new();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let event = {
                let position = self.reader.buffer_position();
                self.reader
                    .read_event_into(&mut buf)
                    .map_err(|source| ParserError::Xml {
                        position: position as u64,
                        source,
                    })?
            };

            match event {
                Event::Start(start) => {
                    let tag = local_name_string(&start);
                    let node = node_from_start(&start).map_err(|source| ParserError::Xml {
                        position: self.reader.buffer_position() as u64,
                        source,
                    })?;
                    stack.push((tag, node));
                },
                Event::Empty(start) => {
                    let tag = local_name_string(&start);
                    let node = node_from_start(&start).map_err(|source| ParserError::Xml {
                        position: self.reader.buffer_position() as u64,
                        source,
                    })?;
                    current_node(&mut root, &mut stack).children.push((tag, node));
                },
                Event::Text(text) => {
                    let unescaped = text
                        .unescape()
                        .map_err(|e| self.xml_error(quick_xml::Error::from(e)))?;
                    current_node(&mut root, &mut stack).push_text(&unescaped);
                },
                Event::CData(data) => {
                    let bytes = data.into_inner();
                    let raw = String::from_utf8_lossy(&bytes);
                    current_node(&mut root, &mut stack).push_text(&raw);
                },
                Event::End(_) => match stack.pop() {
                    Some((tag, node)) => {
                        current_node(&mut root, &mut stack).children.push((tag, node));
                    },
                    None => return Ok(root),
                },
                Event::Eof => {
                    return Err(ParserError::UnexpectedEof { element: root_tag });
                },
                _ => {},
            }
        }
    }

    fn xml_error(&self, source: quick_xml::Error) -> ParserError {
        ParserError::Xml {
            position: self.reader.buffer_position() as u64,
            source,
        }
    }

    /// Fold one citation element into the current upsert chunk
    fn process_citation(&mut self, node: XmlNode) {
        // A record without a parseable PMID is dropped, not an error
        let Some(pmid) = node
            .text_at("PMID")
            .and_then(|text| text.trim().parse::<i32>().ok())
        else {
            return;
        };

        if self.mode.includes_normalized() {
            self.extract_normalized(&node, pmid);
        }

        if self.mode.includes_full() {
            let (year, month, day) = date_parts(&node, "DateRevised");
            let date_revised = construct_date(year, month, day);
            self.upserts.documents.push(CitationDocument {
                pmid,
                date_revised,
                data: node,
            });
        }

        self.upserts.records += 1;
        if self.upserts.records >= self.chunk_size {
            self.ready
                .push_back(OperationChunk::Upsert(std::mem::take(&mut self.upserts)));
        }
    }

    fn extract_normalized(&mut self, node: &XmlNode, pmid: i32) {
        let journal_issn = node
            .text_at("Article/Journal/ISSN")
            .map(str::to_string);

        if let Some(issn) = &journal_issn {
            self.upserts.journals.push(Journal {
                issn: issn.clone(),
                title: node.text_at("Article/Journal/Title").map(str::to_string),
                iso_abbreviation: node
                    .text_at("Article/Journal/ISOAbbreviation")
                    .map(str::to_string),
            });
        }

        let (year, month, day) = date_parts(node, "Article/Journal/JournalIssue/PubDate");
        self.upserts.citations.push(Citation {
            pmid,
            title: node.text_at("Article/ArticleTitle").map(str::to_string),
            abstract_text: node
                .text_at("Article/Abstract/AbstractText")
                .map(str::to_string),
            publication_date: construct_date(year, month, day),
            journal_issn,
        });

        if let Some(author_list) = node.at("Article/AuthorList") {
            for (index, author) in author_list.children_named("Author").enumerate() {
                let last_name = author.text_at("LastName");
                let collective = author.text_at("CollectiveName");

                let (author_id, last_name, fore_name) = match (last_name, collective) {
                    (Some(last), _) => {
                        let fore = author.text_at("ForeName");
                        let id = derive_surrogate_id(&format!(
                            "{}|{}",
                            last,
                            fore.unwrap_or_default()
                        ));
                        (id, Some(last.to_string()), fore.map(str::to_string))
                    },
                    (None, Some(collective)) => {
                        (derive_surrogate_id(collective), Some(collective.to_string()), None)
                    },
                    // An author entry with neither name contributes nothing
                    (None, None) => continue,
                };

                self.upserts.authors.push(Author {
                    author_id,
                    last_name,
                    fore_name,
                    initials: author.text_at("Initials").map(str::to_string),
                });
                self.upserts.citation_authors.push(CitationAuthor {
                    pmid,
                    author_id,
                    display_order: (index + 1) as i32,
                });
            }
        }

        if let Some(mesh_list) = node.child("MeshHeadingList") {
            for heading in mesh_list.children_named("MeshHeading") {
                let Some(descriptor) = heading.child("DescriptorName") else {
                    continue;
                };
                let Some(term) = descriptor.text.as_deref() else {
                    continue;
                };

                let ui = descriptor.attr("UI").unwrap_or_default();
                let mesh_id = derive_surrogate_id(&format!("{}|{}", term, ui));

                self.upserts.mesh_terms.push(MeshTerm {
                    mesh_id,
                    term: term.to_string(),
                    is_major_topic: matches!(descriptor.attr("MajorTopicYN"), Some("Y")),
                });
                self.upserts
                    .citation_mesh_terms
                    .push(CitationMeshTerm { pmid, mesh_id });
            }
        }
    }

    /// Collect PMIDs from a deletion element; unparseable entries are skipped
    fn collect_deletions(&mut self, node: &XmlNode) {
        for pmid_node in node.children_named("PMID") {
            if let Some(pmid) = pmid_node
                .text
                .as_deref()
                .and_then(|text| text.trim().parse::<i32>().ok())
            {
                self.deletions.push(pmid);
            }
        }

        if self.deletions.len() >= self.chunk_size {
            self.ready
                .push_back(OperationChunk::Delete(std::mem::take(&mut self.deletions)));
        }
    }

    /// Emit what is left at end of stream: upserts first, then deletions
    fn flush_remaining(&mut self) {
        if !self.upserts.is_empty() {
            self.ready
                .push_back(OperationChunk::Upsert(std::mem::take(&mut self.upserts)));
        }
        if !self.deletions.is_empty() {
            self.ready
                .push_back(OperationChunk::Delete(std::mem::take(&mut self.deletions)));
        }
        self.finished = true;
    }
}

impl<R: BufRead> Iterator for CitationStream<R> {
    type Item = Result<OperationChunk, ParserError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chunk) = self.ready.pop_front() {
                return Some(Ok(chunk));
            }
            if self.finished {
                return None;
            }
            if let Err(e) = self.pump() {
                self.finished = true;
                return Some(Err(e));
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn local_name_string(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

/// Build a childless node from a start tag, capturing its attributes
fn node_from_start(start: &BytesStart<'_>) -> Result<XmlNode, quick_xml::Error> {
    let mut node = XmlNode::default();
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(quick_xml::Error::from)?
            .into_owned();
        node.attributes.push((key, value));
    }
    Ok(node)
}

fn current_node<'a>(
    root: &'a mut XmlNode,
    stack: &'a mut Vec<(String, XmlNode)>,
) -> &'a mut XmlNode {
    match stack.last_mut() {
        Some((_, node)) => node,
        None => root,
    }
}

/// Year/Month/Day texts of a date element at the given path
fn date_parts<'a>(
    node: &'a XmlNode,
    path: &str,
) -> (Option<&'a str>, Option<&'a str>, Option<&'a str>) {
    match node.at(path) {
        Some(date) => (
            date.text_at("Year"),
            date.text_at("Month"),
            date.text_at("Day"),
        ),
        None => (None, None, None),
    }
}

/// Build a calendar date from raw text components
///
/// A missing year yields None; missing month or day default to "01";
/// three-letter month abbreviations map to their numeric form; any value
/// that does not form a valid calendar date yields None rather than an
/// error.
pub fn construct_date(
    year: Option<&str>,
    month: Option<&str>,
    day: Option<&str>,
) -> Option<NaiveDate> {
    let year = year?.trim();
    if year.is_empty() {
        return None;
    }

    let month = month.unwrap_or("01");
    let month = match month {
        "Jan" => "01",
        "Feb" => "02",
        "Mar" => "03",
        "Apr" => "04",
        "May" => "05",
        "Jun" => "06",
        "Jul" => "07",
        "Aug" => "08",
        "Sep" => "09",
        "Oct" => "10",
        "Nov" => "11",
        "Dec" => "12",
        other => other,
    };
    let day = day.unwrap_or("01");

    let year: i32 = year.parse().ok()?;
    let month: u32 = month.trim().parse().ok()?;
    let day: u32 = day.trim().parse().ok()?;

    NaiveDate::from_ymd_opt(year, month, day)
}

/// Derive a stable surrogate id from a natural-key string
///
/// First eight bytes of the MD5 digest, little-endian. Collisions are an
/// accepted tradeoff inherited from the source schema.
pub fn derive_surrogate_id(natural_key: &str) -> i64 {
    let digest = md5::compute(natural_key.as_bytes());
    let d = digest.0;
    i64::from_le_bytes([d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]])
}

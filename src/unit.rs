//! The unit of work: one page image awaiting conversion.

use std::fmt;
use std::sync::Arc;

/// One page-equivalent conversion task.
///
/// Built once by the caller (usually from the renderer's output) and never
/// mutated by the pipeline. The payload is reference-counted so handing a
/// unit to a spawned task or to several fallback backends never copies the
/// image bytes.
#[derive(Clone)]
pub struct ConversionUnit {
    index: usize,
    payload: Arc<[u8]>,
    identity: String,
}

impl ConversionUnit {
    /// Create a unit. `index` is the 0-based position in the document.
    pub fn new(index: usize, payload: impl Into<Arc<[u8]>>, identity: impl Into<String>) -> Self {
        Self {
            index,
            payload: payload.into(),
            identity: identity.into(),
        }
    }

    /// Build an ordered unit sequence from raw page payloads.
    ///
    /// Identities are `page-0001`, `page-0002`, … (1-based, like page numbers).
    pub fn from_pages<I, P>(pages: I) -> Vec<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<Arc<[u8]>>,
    {
        pages
            .into_iter()
            .enumerate()
            .map(|(i, p)| Self::new(i, p, format!("page-{:04}", i + 1)))
            .collect()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// 1-based page number, for log lines and separators.
    pub fn page_num(&self) -> usize {
        self.index + 1
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Debug for ConversionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionUnit")
            .field("index", &self.index)
            .field("identity", &self.identity)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

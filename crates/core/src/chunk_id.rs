//! Chunk identity.
//!
//! A chunk id is `<Title>_Page_<Page>_ChunkNo_<Seq>` with spaces in the title
//! replaced by underscores. `Seq` counts chunks within one run of equal
//! `(title, page)` keys in batch order, so ids are reproducible only when the
//! ingestion order is. The chunker always emits a page's chunks contiguously,
//! which makes `Seq` the chunk's position within its page.
//!
//! Known issue: stubs without a title all map to `unknown`, and a stub without
//! a page maps to page `1`, so distinct chunks can share an id. The index then
//! keeps only the first of them.

use crate::models::ChunkMetadata;

pub const UNKNOWN_TITLE: &str = "unknown";
const DEFAULT_PAGE: u32 = 1;

pub fn sanitize_title(title: Option<&str>) -> String {
    title.unwrap_or(UNKNOWN_TITLE).replace(' ', "_")
}

pub fn chunk_id(title: Option<&str>, page: u32, seq_in_page: u32) -> String {
    format!(
        "{}_Page_{}_ChunkNo_{}",
        sanitize_title(title),
        page,
        seq_in_page
    )
}

/// Populates `chunk_id` and `seq_in_page` on every stub, in order.
pub fn assign_chunk_ids(metadatas: &mut [ChunkMetadata]) {
    let mut previous: Option<(String, u32)> = None;
    let mut seq = 0u32;

    for metadata in metadatas.iter_mut() {
        let title = metadata.bill.title.as_deref();
        let page = metadata.page.unwrap_or(DEFAULT_PAGE);
        let key = (sanitize_title(title), page);

        seq = match &previous {
            Some(last) if *last == key => seq + 1,
            _ => 0,
        };

        metadata.chunk_id = Some(chunk_id(title, page, seq));
        metadata.seq_in_page = Some(seq);
        previous = Some(key);
    }
}

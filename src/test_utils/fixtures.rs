use std::path::PathBuf;

use tempfile::TempDir;

use crate::search::HashEmbedder;
use crate::storage::{Database, NewItem, Store};

/// Small news corpus used across tests. Titles are unique.
pub const SAMPLE_ITEMS: &[(&str, &str, &str, &str)] = &[
    (
        "Reuters",
        "Climate risk assessment gains traction",
        "Banks and insurers are building climate risk models into lending decisions.",
        "2026-03-08T09:00:00Z",
    ),
    (
        "FT",
        "Insurers price in flood exposure",
        "Rising sea levels push insurers to reprice coastal climate exposure.",
        "2026-03-07T09:00:00Z",
    ),
    (
        "Bloomberg",
        "Offshore wind auctions attract record bids",
        "Developers bid for new offshore wind capacity in the North Sea.",
        "2026-03-06T09:00:00Z",
    ),
    (
        "Bloomberg",
        "Grid battery storage expands",
        "Utilities add battery storage to balance renewable supply.",
        "2026-03-05T09:00:00Z",
    ),
    (
        "Reuters",
        "Chip exports slow amid trade tensions",
        "Semiconductor shipments fell for the third quarter.",
        "2026-03-04T09:00:00Z",
    ),
    (
        "Guardian",
        "Heat pumps outsell gas boilers",
        "Heat pump installations rose sharply as homeowners electrify heating.",
        "2026-03-03T09:00:00Z",
    ),
    (
        "FT",
        "Central bank holds rates steady",
        "Policy makers kept interest rates unchanged citing inflation risk.",
        "2026-03-02T09:00:00Z",
    ),
    (
        "Guardian",
        "Drought threatens harvests",
        "A prolonged drought raises climate and food security risk across the region.",
        "2026-03-01T09:00:00Z",
    ),
];

pub fn new_item(guid: &str, title: &str, published_at: &str) -> NewItem {
    NewItem {
        guid: guid.to_string(),
        feed: "Test Feed".to_string(),
        title: title.to_string(),
        summary: String::new(),
        author: None,
        link: None,
        published_at: published_at.to_string(),
    }
}

pub fn sample_items() -> Vec<NewItem> {
    SAMPLE_ITEMS
        .iter()
        .enumerate()
        .map(|(idx, (feed, title, summary, published_at))| NewItem {
            guid: format!("sample-{idx}"),
            feed: (*feed).to_string(),
            title: (*title).to_string(),
            summary: (*summary).to_string(),
            author: None,
            link: Some(format!("https://news.example/{idx}")),
            published_at: (*published_at).to_string(),
        })
        .collect()
}

/// In-memory database holding the sample items, without embeddings.
pub fn seeded_database() -> Database {
    let db = Database::open_in_memory().expect("open in-memory database");
    for item in sample_items() {
        db.upsert_item(&item).expect("insert sample item");
    }
    db
}

/// In-memory store holding the sample items with hash embeddings of `dims`.
pub fn seeded_store(dims: usize) -> Store {
    let store = Store::open_in_memory().expect("open in-memory store");
    let embedder = HashEmbedder::new(dims);
    store
        .write(|db| {
            for item in sample_items() {
                let id = db.upsert_item(&item)?;
                let text = format!("{}\n{}", item.title, item.summary);
                db.set_item_embedding(id, &embedder.embed(&text))?;
            }
            Ok(())
        })
        .expect("seed store");
    store
}

/// Temporary data directory for tests that need files on disk.
pub struct DataDirFixture {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl DataDirFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().to_path_buf();
        Self { temp_dir, path }
    }

    pub fn write(&self, relative: &str, content: &str) -> PathBuf {
        let full = self.path.join(relative);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        std::fs::write(&full, content).expect("Failed to write file");
        full
    }
}

mod token_collection;
mod top_entries;

pub use token_collection::TokenCollection;
pub use top_entries::TopEntries;

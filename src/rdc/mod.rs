//! Remote differential compression.
//!
//! Content is described by hierarchical chunk signatures. Comparing the
//! receiver's signatures (the seed) with the sender's (the source) yields a
//! need list of seed ranges to copy and source ranges to transfer.

pub mod apply;
pub mod chunker;
pub mod needlist;
pub mod remote;
pub mod repository;
pub mod signature;

pub use apply::{
    apply_need_list, part_channel, send_bytes, send_need_list, ForwardReader, NeedListWriter,
    PartReceiver, PartSender, SourceAccess, TransferPart, TransferStats, DATA_CHUNK_SIZE,
};
pub use chunker::Chunker;
pub use needlist::{create_need_list, summarize, NeedListItem, NeedListSummary};
pub use remote::synchronize_signatures;
pub use repository::SignatureRepository;
pub use signature::{
    decode_records, encode_records, generate_signatures, signature_name, ChunkSignature,
    SignatureInfo, SignatureManifest,
};

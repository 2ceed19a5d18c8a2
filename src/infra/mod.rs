// ============================================================
// Infrastructure Layer
// ============================================================
// File-backed helpers that sit outside the model graph.
//
//   embedding_store.rs — loads pretrained GenePT / drug vectors
//                        from JSON and aligns them to a vocab

/// Pretrained embedding loading
pub mod embedding_store;

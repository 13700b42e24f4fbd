pub mod document_enrichment;

//! Shared utility functions for sqlforge.
//!
//! This module provides common utilities used across multiple modules,
//! including SQL extraction from LLM responses.

pub mod sql_extraction;

pub use sql_extraction::{
    extract_bare_statement, extract_from_generic_code_block, extract_from_labelled_line,
    extract_from_sql_code_block, extract_sql_from_response, first_statement, starts_with_keyword,
};

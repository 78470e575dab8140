//! An embeddable execution core for the Refrain language.
#![cfg_attr(all(docsrs, not(doctest)), feature(doc_auto_cfg))]

pub use refrain_lang::*;

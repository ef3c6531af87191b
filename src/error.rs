// Copyright (c) the RawDec Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use std::collections::TryReserveError;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Bit stream exhausted near byte {0}")]
    TruncatedStream(usize),
    #[error("Corrupt bit stream: {0}")]
    CorruptStream(String),
    #[error("Bad Huffman table: {0}")]
    BadHuffmanTable(String),
    #[error("Bad slice geometry: {0}")]
    BadSliceGeometry(String),
    #[error("Usage error: {0}")]
    UsageError(String),
    #[error("Out of memory: {0}")]
    OutOfMemory(#[from] TryReserveError),
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

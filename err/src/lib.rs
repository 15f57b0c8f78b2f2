// Copyright 2025 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("No adaptor present")]
    DeviceAbsent,
    #[error("Protocol: unexpected response to {0}")]
    Protocol(&'static str),
    #[error("Read checksum mismatch")]
    ReadChecksum,
    #[error("Authentication failed")]
    AuthFailure,
    #[error("Uncorrectable ECC state in page {page}, chunk {chunk}")]
    Ecc { page: u32, chunk: usize },
    #[error("Card and image geometry differ")]
    GeometryMismatch,
    #[error("Invalid superblock")]
    InvalidSuperblock,
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("USB: {0}")]
    Usb(#[from] rusb::Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
}

pub type Result<T> = core::result::Result<T, Error>;

// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! QR code payload codec.
//!
//! The engine treats the scannable payload as opaque beyond
//! round-tripping the 6-digit code and a mode flag telling the scanner
//! which validator screen to open. Image encoding/decoding happens
//! elsewhere.

use crate::transaction::PaymentCode;
use serde::{Deserialize, Serialize};

/// Which flow the scanned code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadMode {
    Payment,
    Grab,
}

/// JSON payload embedded in the QR image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodePayload {
    pub code: PaymentCode,
    pub mode: PayloadMode,
}

impl CodePayload {
    pub fn new(code: PaymentCode, mode: PayloadMode) -> Self {
        Self { code, mode }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

// Copyright 2025 Lablup Inc.
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

//! Per-host output tagging.
//!
//! Output from all hosts is merged into the controller's stdout/stderr.
//! Every line gets the host prefix re-emitted at its start so interleaved
//! output stays attributable. Partial lines are buffered until their newline
//! arrives (or the stream ends), which keeps a line from one host from being
//! split by another host's output.

use owo_colors::AnsiColors;

/// Color cycle for host prefixes, assigned by client index.
const PREFIX_COLORS: [AnsiColors; 7] = [
    AnsiColors::Cyan,
    AnsiColors::Green,
    AnsiColors::Yellow,
    AnsiColors::Blue,
    AnsiColors::Magenta,
    AnsiColors::BrightCyan,
    AnsiColors::BrightGreen,
];

pub fn prefix_color(index: usize) -> AnsiColors {
    PREFIX_COLORS[index % PREFIX_COLORS.len()]
}

/// Line-oriented prefixer. Feed raw chunks in, get back whole prefixed lines;
/// an unterminated tail is held until the next chunk or `flush`.
#[derive(Debug)]
pub struct LinePrefixer {
    prefix: String,
    pending: Vec<u8>,
}

impl LinePrefixer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            pending: Vec::new(),
        }
    }

    /// Consume a chunk and return every complete line in it, each prepended
    /// with the prefix. Bytes after the last newline stay buffered.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            out.extend_from_slice(self.prefix.as_bytes());
            out.extend_from_slice(&line);
        }
        out
    }

    /// Emit any buffered partial line, prefixed, without appending a newline.
    /// Called once the stream reaches EOF.
    pub fn flush(&mut self) -> Vec<u8> {
        if self.pending.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(self.prefix.len() + self.pending.len());
        out.extend_from_slice(self.prefix.as_bytes());
        out.append(&mut self.pending);
        out
    }
}

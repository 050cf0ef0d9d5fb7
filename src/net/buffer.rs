/* This file is part of proxyscan
 *
 * Copyright (C) 2020-2026 Dyne.org foundation
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

/// Ordered bytes received from a socket and not yet consumed by a handler.
#[derive(Debug, Default, Clone)]
pub struct ReadBuffer {
    buf: Vec<u8>,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Look at the first `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        self.buf.get(..n)
    }

    /// Drop the first `n` bytes (or everything, if fewer are buffered).
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    /// Take a fixed-length binary record. Returns `None` and leaves the
    /// buffer untouched while fewer than `n` bytes are available.
    pub fn take_exact(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.buf.len() < n {
            return None
        }

        Some(self.buf.drain(..n).collect())
    }

    /// Take one newline-terminated line, without its terminator. Both `\n`
    /// and `\r\n` endings are accepted. A partial line stays buffered.
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let eol = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=eol).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        Some(line)
    }

    /// Take everything up to and including the first occurrence of
    /// `delimiter`.
    pub fn take_until(&mut self, delimiter: &[u8]) -> Option<Vec<u8>> {
        let pos = self.find(delimiter)?;
        Some(self.buf.drain(..pos + delimiter.len()).collect())
    }

    /// Offset of the first occurrence of `needle` in the buffered bytes.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0)
        }

        self.buf.windows(needle.len()).position(|w| w == needle)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Output queued for a socket, flushed strictly in FIFO order.
#[derive(Debug, Default, Clone)]
pub struct WriteBuffer {
    buf: Vec<u8>,
    pos: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes still waiting to be written.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark `n` bytes as written by the socket.
    pub fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.buf.len());
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }
}

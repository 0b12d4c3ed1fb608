// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Raw file primitive used by file-backed stores.
//!
//! Framed files hold `[u32 little-endian length][payload]` records, unframed
//! files hold newline-delimited lines.

use async_trait::async_trait;
use std::io;
use std::path::Path;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{error, warn};

pub const FRAME_SIZE: usize = 4;

/// Records at or above this size are suspicious enough to log before reading.
const LARGE_RECORD_WARNING: u32 = 1 << 31;

#[async_trait]
pub trait FileInterface: Send + Sync {
    fn name(&self) -> &str;

    async fn open_read(&mut self) -> io::Result<()>;

    /// Opens for append, creating the parent directory if needed.
    async fn open_write(&mut self) -> io::Result<()>;

    async fn open_truncate(&mut self) -> io::Result<()>;

    fn is_open(&self) -> bool;

    async fn close(&mut self);

    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    async fn flush(&mut self) -> io::Result<()>;

    /// Size on disk, zero when the file can't be inspected.
    async fn file_size(&self) -> u64;

    /// Next record if framed, next line otherwise. `None` at end of file.
    async fn read_next(&mut self) -> io::Result<Option<Vec<u8>>>;

    async fn delete_file(&mut self) -> io::Result<()>;

    /// Length prefix for a payload of `len` bytes; empty when unframed.
    fn frame(&self, len: usize) -> Vec<u8>;
}

/// Builds the file backend named by `fs_type`. Only `std` exists.
pub fn create_file_interface(
    fs_type: &str,
    name: &str,
    framed: bool,
) -> Option<Box<dyn FileInterface>> {
    match fs_type {
        "std" => Some(Box::new(StdFile::new(name, framed))),
        _ => None,
    }
}

/// Entry names in `path`; empty when the directory is missing or unreadable.
pub async fn list(path: &str, fs_type: &str) -> Vec<String> {
    if fs_type != "std" {
        error!("Unknown fs_type <{}> listing <{}>", fs_type, path);
        return Vec::new();
    }

    let mut names = Vec::new();
    let mut entries = match fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return names,
        Err(e) => {
            warn!("Error <{}> listing files in <{}>", e, path);
            return names;
        }
    };
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => names.push(entry.file_name().to_string_lossy().into_owned()),
            Ok(None) => break,
            Err(e) => {
                warn!("Error <{}> listing files in <{}>", e, path);
                break;
            }
        }
    }
    names
}

/// Points `link` at `target`, replacing whatever was there.
pub async fn replace_symlink(target: &str, link: &str) -> io::Result<()> {
    match fs::remove_file(link).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    #[cfg(unix)]
    {
        fs::symlink(target, link).await
    }
    #[cfg(not(unix))]
    {
        let _ = target;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symlinks are only created on unix",
        ))
    }
}

enum Handle {
    Closed,
    Read(BufReader<File>),
    Write(File),
}

pub struct StdFile {
    name: String,
    framed: bool,
    handle: Handle,
    /// Unread bytes left in a file opened for reading.
    unread: u64,
}

impl StdFile {
    #[must_use]
    pub fn new(name: &str, framed: bool) -> Self {
        StdFile {
            name: name.to_string(),
            framed,
            handle: Handle::Closed,
            unread: 0,
        }
    }

    fn ensure_closed(&self) -> io::Result<()> {
        if self.is_open() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("file <{}> is already open", self.name),
            ));
        }
        Ok(())
    }

    async fn create_parent(&self) -> io::Result<()> {
        match Path::new(&self.name).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent).await,
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl FileInterface for StdFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_read(&mut self) -> io::Result<()> {
        self.ensure_closed()?;
        let file = File::open(&self.name).await?;
        self.unread = file.metadata().await?.len();
        self.handle = Handle::Read(BufReader::new(file));
        Ok(())
    }

    async fn open_write(&mut self) -> io::Result<()> {
        self.ensure_closed()?;
        self.create_parent().await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.name)
            .await?;
        self.handle = Handle::Write(file);
        Ok(())
    }

    async fn open_truncate(&mut self) -> io::Result<()> {
        self.ensure_closed()?;
        self.create_parent().await?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.name)
            .await?;
        self.handle = Handle::Write(file);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !matches!(self.handle, Handle::Closed)
    }

    async fn close(&mut self) {
        if let Handle::Write(file) = &mut self.handle {
            if let Err(e) = file.flush().await {
                warn!("Failed to flush <{}> on close: {}", self.name, e);
            }
        }
        self.handle = Handle::Closed;
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let Handle::Write(file) = &mut self.handle else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("file <{}> is not open for writing", self.name),
            ));
        };
        file.write_all(data).await?;
        file.flush().await
    }

    async fn flush(&mut self) -> io::Result<()> {
        match &mut self.handle {
            Handle::Write(file) => file.flush().await,
            _ => Ok(()),
        }
    }

    async fn file_size(&self) -> u64 {
        match fs::metadata(&self.name).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to get size for file <{}> error <{}>", self.name, e);
                }
                0
            }
        }
    }

    async fn read_next(&mut self) -> io::Result<Option<Vec<u8>>> {
        let Handle::Read(reader) = &mut self.handle else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("file <{}> is not open for reading", self.name),
            ));
        };

        if self.framed {
            let mut len_buf = [0u8; FRAME_SIZE];
            match reader.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            }
            self.unread = self.unread.saturating_sub(FRAME_SIZE as u64);
            let len = u32::from_le_bytes(len_buf);
            // zero length marks padding or the end of valid data
            if len == 0 {
                return Ok(None);
            }
            if len >= LARGE_RECORD_WARNING {
                warn!("Attempting to read record of size {} bytes from <{}>", len, self.name);
            }
            if u64::from(len) > self.unread {
                error!(
                    "Corrupt record in <{}>: length {} exceeds the {} bytes left",
                    self.name, len, self.unread
                );
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("record length {len} runs past the end of <{}>", self.name),
                ));
            }
            let mut record = vec![0u8; len as usize];
            if let Err(e) = reader.read_exact(&mut record).await {
                error!("Failed to read record of {} bytes from <{}>: {}", len, self.name, e);
                return Err(e);
            }
            self.unread -= u64::from(len);
            Ok(Some(record))
        } else {
            let mut line = Vec::new();
            let read = reader.read_until(b'\n', &mut line).await?;
            if read == 0 {
                return Ok(None);
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            Ok(Some(line))
        }
    }

    async fn delete_file(&mut self) -> io::Result<()> {
        self.close().await;
        match fs::remove_file(&self.name).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn frame(&self, len: usize) -> Vec<u8> {
        if self.framed {
            u32::try_from(len)
                .unwrap_or(u32::MAX)
                .to_le_bytes()
                .to_vec()
        } else {
            Vec::new()
        }
    }
}

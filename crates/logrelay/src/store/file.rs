// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rotating on-disk store.
//!
//! Files are named `<file_path>/<base>[-YYYY-MM-DD]_NNNNN`. The date part is
//! present only when a rotation period is configured, and `NNNNN` grows by one
//! on every rotation. Replay operations always target the lowest suffix.
//!
//! Each record is laid out as:
//!
//! ```text
//! [zero padding to the next chunk][category frame, category, '\n'][frame][message]['\n']
//!  only with chunk_size           only with write_category               only with add_newlines
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, Timelike};
use tracing::{debug, error, info, warn};

use crate::conf::StoreConf;
use crate::entry::LogEntry;
use crate::file::{self, FileInterface};
use crate::store::{Store, StoreBase, StoreType};

pub const DEFAULT_FILE_PATH: &str = "/tmp";
pub const DEFAULT_MAX_SIZE: u64 = 1_000_000_000;
pub const DEFAULT_ROLL_HOUR: u32 = 1;
pub const DEFAULT_ROLL_MINUTE: u32 = 15;
pub const META_LOGFILE_PREFIX: &str = "logrelay_meta<new_logfile>: ";
pub const STATS_FILENAME: &str = "logrelay_stats";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollPeriod {
    Never,
    Hourly,
    Daily,
}

#[derive(Clone, Debug)]
struct FileSettings {
    file_path: String,
    base_filename: String,
    max_size: u64,
    roll_period: RollPeriod,
    roll_hour: u32,
    roll_minute: u32,
    fs_type: String,
    chunk_size: u64,
    write_meta: bool,
    write_category: bool,
    create_symlink: bool,
    add_newlines: bool,
    framed: Option<bool>,
}

impl FileSettings {
    fn new(category: &str) -> Self {
        FileSettings {
            file_path: DEFAULT_FILE_PATH.to_string(),
            base_filename: category.to_string(),
            max_size: DEFAULT_MAX_SIZE,
            roll_period: RollPeriod::Never,
            roll_hour: DEFAULT_ROLL_HOUR,
            roll_minute: DEFAULT_ROLL_MINUTE,
            fs_type: "std".to_string(),
            chunk_size: 0,
            write_meta: false,
            write_category: false,
            create_symlink: true,
            add_newlines: false,
            framed: None,
        }
    }
}

pub struct FileStore {
    base: StoreBase,
    settings: FileSettings,
    is_buffer_file: bool,
    write_file: Option<Box<dyn FileInterface>>,
    current_size: u64,
    current_filename: String,
    last_roll_time: u32,
    events_written: u64,
}

/// Zero bytes needed so a record of `message_length` bytes doesn't straddle a
/// chunk boundary. A `chunk_size` of zero disables padding.
#[must_use]
pub fn bytes_to_pad(message_length: u64, current_file_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    let space_left_in_chunk = chunk_size - current_file_size % chunk_size;
    if message_length > space_left_in_chunk {
        space_left_in_chunk
    } else {
        0
    }
}

/// Numeric suffix of `filename` when it belongs to `base_filename`.
#[must_use]
pub fn file_suffix(filename: &str, base_filename: &str) -> Option<u32> {
    let (prefix, suffix) = filename.rsplit_once('_')?;
    if prefix != base_filename {
        return None;
    }
    let digits: String = suffix.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

impl FileStore {
    #[must_use]
    pub fn new(category: &str, multi_category: bool, is_buffer_file: bool) -> Self {
        FileStore {
            base: StoreBase::new(category, StoreType::File, multi_category),
            settings: FileSettings::new(category),
            is_buffer_file,
            write_file: None,
            current_size: 0,
            current_filename: String::new(),
            last_roll_time: 0,
            events_written: 0,
        }
    }

    fn framed(&self) -> bool {
        self.is_buffer_file
            || self
                .settings
                .framed
                .unwrap_or(!self.settings.add_newlines)
    }

    pub fn current_filename(&self) -> &str {
        &self.current_filename
    }

    fn base_filename_at(&self, now: &DateTime<Local>) -> String {
        match self.settings.roll_period {
            RollPeriod::Never => self.settings.base_filename.clone(),
            _ => format!("{}-{}", self.settings.base_filename, now.format("%Y-%m-%d")),
        }
    }

    fn full_filename(&self, suffix: u32, now: &DateTime<Local>) -> String {
        format!(
            "{}/{}_{:05}",
            self.settings.file_path,
            self.base_filename_at(now),
            suffix
        )
    }

    fn full_symlink(&self) -> String {
        format!("{}/{}_current", self.settings.file_path, self.base.category)
    }

    async fn suffixes(&self, base_filename: &str) -> Vec<u32> {
        file::list(&self.settings.file_path, &self.settings.fs_type)
            .await
            .iter()
            .filter_map(|name| file_suffix(name, base_filename))
            .collect()
    }

    pub async fn find_newest_file(&self, base_filename: &str) -> Option<u32> {
        self.suffixes(base_filename).await.into_iter().max()
    }

    pub async fn find_oldest_file(&self, base_filename: &str) -> Option<u32> {
        self.suffixes(base_filename).await.into_iter().min()
    }

    async fn open_internal(&mut self, increment: bool, now: DateTime<Local>) -> bool {
        let suffix = match self.find_newest_file(&self.base_filename_at(&now)).await {
            Some(newest) if increment => newest + 1,
            Some(newest) => newest,
            None => 0,
        };
        let filename = self.full_filename(suffix, &now);

        self.last_roll_time = match self.settings.roll_period {
            RollPeriod::Daily => now.day(),
            _ => now.hour(),
        };

        if let Some(mut old) = self.write_file.take() {
            if self.settings.write_meta {
                let meta = format!("{META_LOGFILE_PREFIX}{filename}");
                let mut record = old.frame(meta.len());
                record.extend_from_slice(meta.as_bytes());
                if let Err(e) = old.write(&record).await {
                    warn!(
                        "[{}] Failed to write meta record to <{}>: {}",
                        self.base.category,
                        old.name(),
                        e
                    );
                }
            }
            old.close().await;
        }

        let framed = self.framed();
        let Some(mut write_file) =
            file::create_file_interface(&self.settings.fs_type, &filename, framed)
        else {
            error!(
                "[{}] Failed to create file <{}> of type <{}> for writing",
                self.base.category, filename, self.settings.fs_type
            );
            self.base.set_status("file open error");
            return false;
        };

        if let Err(e) = write_file.open_write().await {
            error!(
                "[{}] Failed to open file <{}> for writing: {}",
                self.base.category, filename, e
            );
            self.base.set_status("File open error");
            return false;
        }

        if self.settings.create_symlink && !self.is_buffer_file {
            let link = self.full_symlink();
            if let Err(e) = file::replace_symlink(&filename, &link).await {
                warn!(
                    "[{}] Failed to point <{}> at <{}>: {}",
                    self.base.category, link, filename, e
                );
            }
        }

        info!("[{}] Opened file <{}> for writing", self.base.category, filename);
        self.current_size = write_file.file_size().await;
        self.current_filename = filename;
        self.events_written = 0;
        self.write_file = Some(write_file);
        self.base.set_status("");
        true
    }

    async fn rotate_file(&mut self, now: DateTime<Local>) {
        info!(
            "[{}] {:02}:{:02} rotating file <{}> old size <{}> max size <{}>",
            self.base.category,
            now.hour(),
            now.minute(),
            self.current_filename,
            self.current_size,
            self.settings.max_size
        );
        self.print_stats(&now).await;
        self.open_internal(true, now).await;
    }

    async fn print_stats(&self, now: &DateTime<Local>) {
        let filename = format!("{}/{}", self.settings.file_path, STATS_FILENAME);
        let Some(mut stats_file) =
            file::create_file_interface(&self.settings.fs_type, &filename, false)
        else {
            return;
        };
        if let Err(e) = stats_file.open_write().await {
            warn!(
                "[{}] Failed to open stats file <{}> for writing: {}",
                self.base.category, filename, e
            );
            return;
        }
        let line = format!(
            "{} wrote <{}> bytes in <{}> events to file <{}>\n",
            now.format("%Y-%m-%d-%H:%M"),
            self.current_size,
            self.events_written,
            self.current_filename
        );
        if let Err(e) = stats_file.write(line.as_bytes()).await {
            warn!("[{}] Failed to write stats: {}", self.base.category, e);
        }
        stats_file.close().await;
    }

    /// Serializes `messages` as they would land in `target` at `start_size`.
    /// Returns the bytes and the file size after writing them.
    fn encode_messages(
        &self,
        messages: &[LogEntry],
        target: &dyn FileInterface,
        start_size: u64,
    ) -> (Vec<u8>, u64) {
        let mut buffer = Vec::new();
        let mut size = start_size;

        for entry in messages {
            let mut message_length = entry.message.len();
            if self.settings.add_newlines {
                message_length += 1;
            }
            let mut length = message_length as u64;

            let mut category_frame = Vec::new();
            if self.settings.write_category {
                let category_length = entry.category.len() + 1;
                category_frame = target.frame(category_length);
                length += (category_length + category_frame.len()) as u64;
            }

            let frame = target.frame(message_length);
            length += frame.len() as u64;

            let padding = bytes_to_pad(length, size, self.settings.chunk_size);
            length += padding;
            buffer.resize(buffer.len() + padding as usize, 0);

            if self.settings.write_category {
                buffer.extend_from_slice(&category_frame);
                buffer.extend_from_slice(entry.category.as_bytes());
                buffer.push(b'\n');
            }
            buffer.extend_from_slice(&frame);
            buffer.extend_from_slice(&entry.message);
            if self.settings.add_newlines {
                buffer.push(b'\n');
            }
            size += length;
        }
        (buffer, size)
    }

    async fn oldest_filename(&self, now: &DateTime<Local>) -> Option<String> {
        let base_filename = self.base_filename_at(now);
        self.find_oldest_file(&base_filename)
            .await
            .map(|index| self.full_filename(index, now))
    }
}

#[async_trait]
impl Store for FileStore {
    fn category(&self) -> &str {
        &self.base.category
    }

    fn store_type(&self) -> StoreType {
        self.base.store_type
    }

    fn multi_category(&self) -> bool {
        self.base.multi_category
    }

    fn copy(&self, category: &str) -> Box<dyn Store> {
        let mut settings = self.settings.clone();
        settings.file_path = format!("{}/{}", self.settings.file_path, category);
        settings.base_filename = category.to_string();
        Box::new(FileStore {
            base: self.base.copy_for(category),
            settings,
            is_buffer_file: self.is_buffer_file,
            write_file: None,
            current_size: 0,
            current_filename: String::new(),
            last_roll_time: 0,
            events_written: 0,
        })
    }

    fn configure(&mut self, conf: &StoreConf) {
        let category = &self.base.category;
        let settings = &mut self.settings;

        if let Some(path) = conf.get_string("file_path") {
            settings.file_path = path.to_string();
        }
        match conf.get_string("base_filename") {
            Some(base) => settings.base_filename = base.to_string(),
            None => debug!(
                "[{}] No base_filename specified for file store, using category",
                category
            ),
        }
        if let Some(period) = conf.get_string("rotate_period") {
            match period {
                "hourly" => settings.roll_period = RollPeriod::Hourly,
                "daily" => settings.roll_period = RollPeriod::Daily,
                "never" => settings.roll_period = RollPeriod::Never,
                other => warn!("[{}] Bad config - unknown rotate_period <{}>", category, other),
            }
        }
        if let Some(write_meta) = conf.get_flag("write_meta") {
            settings.write_meta = write_meta;
        }
        if let Some(write_category) = conf.get_flag("write_category") {
            settings.write_category = write_category;
        }
        if let Some(create_symlink) = conf.get_flag("create_symlink") {
            settings.create_symlink = create_symlink;
        }
        if let Some(max_size) = conf.get_unsigned("max_size") {
            settings.max_size = max_size;
        }
        if let Some(fs_type) = conf.get_string("fs_type") {
            settings.fs_type = fs_type.to_string();
        }
        if let Some(hour) = conf.get_unsigned("rotate_hour") {
            settings.roll_hour = u32::try_from(hour).unwrap_or(u32::MAX);
        }
        if let Some(minute) = conf.get_unsigned("rotate_minute") {
            settings.roll_minute = u32::try_from(minute).unwrap_or(u32::MAX);
        }
        if let Some(chunk_size) = conf.get_unsigned("chunk_size") {
            settings.chunk_size = chunk_size;
        }
        settings.add_newlines = conf.get_unsigned("add_newlines").unwrap_or(0) != 0;
        settings.framed = conf.get_flag("framed");

        if self.is_buffer_file {
            // replay reads back whole files, so buffer files never roll or pad
            settings.roll_period = RollPeriod::Never;
            settings.chunk_size = 0;
            if self.base.multi_category {
                settings.write_category = true;
            }
        }
        self.base.configured = true;
    }

    async fn open(&mut self) -> bool {
        if !self.base.check_configured() {
            return false;
        }
        self.open_internal(false, Local::now()).await
    }

    fn is_open(&self) -> bool {
        self.write_file.as_ref().is_some_and(|f| f.is_open())
    }

    async fn close(&mut self) {
        if let Some(write_file) = self.write_file.as_mut() {
            write_file.close().await;
        }
    }

    async fn handle_messages(&mut self, messages: &mut Vec<LogEntry>) -> bool {
        let Some(write_file) = self.write_file.as_ref().filter(|f| f.is_open()) else {
            error!(
                "[{}] File store not open in handle_messages",
                self.base.category
            );
            return false;
        };

        let (buffer, new_size) = self.encode_messages(messages, write_file.as_ref(), self.current_size);
        let write_result = match self.write_file.as_mut() {
            Some(write_file) => write_file.write(&buffer).await,
            None => return false,
        };
        if let Err(e) = write_result {
            error!(
                "[{}] File store failed to write ({}) messages to file: {}",
                self.base.category,
                messages.len(),
                e
            );
            self.base.set_status("File write error");
            self.close().await;
            return false;
        }

        self.current_size = new_size;
        self.events_written += messages.len() as u64;
        if self.current_size > self.settings.max_size {
            self.rotate_file(Local::now()).await;
        }
        true
    }

    async fn periodic_check(&mut self) {
        let now = Local::now();
        let rotate = self.current_size > self.settings.max_size
            || match self.settings.roll_period {
                RollPeriod::Never => false,
                RollPeriod::Daily => {
                    now.day() != self.last_roll_time
                        && now.hour() >= self.settings.roll_hour
                        && now.minute() >= self.settings.roll_minute
                }
                RollPeriod::Hourly => {
                    now.hour() != self.last_roll_time && now.minute() >= self.settings.roll_minute
                }
            };
        if rotate {
            self.rotate_file(now).await;
        }
    }

    async fn flush(&mut self) {
        if let Some(write_file) = self.write_file.as_mut() {
            if let Err(e) = write_file.flush().await {
                warn!("[{}] Failed to flush <{}>: {}", self.base.category, write_file.name(), e);
            }
        }
    }

    fn status(&self) -> String {
        self.base.status.clone()
    }

    async fn read_oldest(&mut self, now: DateTime<Local>) -> Option<Vec<LogEntry>> {
        let Some(filename) = self.oldest_filename(&now).await else {
            return Some(Vec::new());
        };
        let mut infile = file::create_file_interface(&self.settings.fs_type, &filename, self.framed())?;
        if let Err(e) = infile.open_read().await {
            error!(
                "[{}] Failed to open file <{}> for reading: {}",
                self.base.category, filename, e
            );
            return None;
        }

        let mut messages = Vec::new();
        loop {
            let record = match infile.read_next().await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    error!(
                        "[{}] Stopped reading <{}> after {} entries: {}",
                        self.base.category,
                        filename,
                        messages.len(),
                        e
                    );
                    break;
                }
            };
            if record.is_empty() {
                continue;
            }

            if self.settings.write_category {
                let mut category = record;
                if category.last() == Some(&b'\n') {
                    category.pop();
                }
                let category = String::from_utf8_lossy(&category).into_owned();
                match infile.read_next().await {
                    Ok(Some(message)) => messages.push(LogEntry { category, message }),
                    _ => {
                        warn!(
                            "[{}] category <{}> not stored with a message",
                            self.base.category, category
                        );
                        break;
                    }
                }
            } else {
                messages.push(LogEntry {
                    category: self.base.category.clone(),
                    message: record,
                });
            }
        }
        infile.close().await;

        debug!(
            "[{}] Read <{}> entries from file <{}>",
            self.base.category,
            messages.len(),
            filename
        );
        Some(messages)
    }

    async fn replace_oldest(&mut self, messages: &mut Vec<LogEntry>, now: DateTime<Local>) -> bool {
        let Some(filename) = self.oldest_filename(&now).await else {
            warn!(
                "[{}] Could not find files <{}>",
                self.base.category,
                self.base_filename_at(&now)
            );
            return false;
        };

        self.close().await;
        let success = match file::create_file_interface(&self.settings.fs_type, &filename, self.framed()) {
            Some(mut infile) => {
                let mut success = false;
                match infile.open_truncate().await {
                    Ok(()) => {
                        let (buffer, _) = self.encode_messages(messages, infile.as_ref(), 0);
                        match infile.write(&buffer).await {
                            Ok(()) => success = true,
                            Err(e) => error!(
                                "[{}] Failed to rewrite <{}>: {}",
                                self.base.category, filename, e
                            ),
                        }
                    }
                    Err(e) => error!(
                        "[{}] Failed to open file <{}> for writing and truncate: {}",
                        self.base.category, filename, e
                    ),
                }
                infile.close().await;
                success
            }
            None => false,
        };
        self.open().await;
        success
    }

    async fn delete_oldest(&mut self, now: DateTime<Local>) {
        let Some(filename) = self.oldest_filename(&now).await else {
            return;
        };

        let deleting_current = filename == self.current_filename && self.is_open();
        if deleting_current {
            self.close().await;
        }
        if let Some(mut victim) = file::create_file_interface(&self.settings.fs_type, &filename, false) {
            if let Err(e) = victim.delete_file().await {
                warn!("[{}] Failed to delete <{}>: {}", self.base.category, filename, e);
            }
        }
        if deleting_current {
            self.open_internal(false, now).await;
        }
    }

    async fn empty(&mut self, now: DateTime<Local>) -> bool {
        let base_filename = self.base_filename_at(&now);
        for suffix in self.suffixes(&base_filename).await {
            let filename = self.full_filename(suffix, &now);
            if let Some(file) = file::create_file_interface(&self.settings.fs_type, &filename, false) {
                if file.file_size().await > 0 {
                    return false;
                }
            }
        }
        true
    }
}

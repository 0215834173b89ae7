// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Item framing and payload encodings shared by the storage back-ends.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Component;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::{
    check_name, ContentType, Frame, ItemHeader, MigrationFsType,
    MigrationType, SnapshotInfo, StorageError, VolumeData, VolumeStream,
    VolumeTargetArgs, FEATURE_COMPRESS, FEATURE_DELETE,
};

/// Largest payload carried by a single data frame.
pub(crate) const CHUNK_SIZE: usize = 128 * 1024;

fn describe(frame: &Frame) -> &'static str {
    match frame {
        Frame::Header(_) => "item header",
        Frame::Data(_) => "data",
        Frame::EndItem => "end of item",
        Frame::Done => "end of stream",
    }
}

pub(crate) async fn send_item(
    stream: &mut dyn VolumeStream,
    header: ItemHeader,
    data: &[u8],
) -> Result<(), StorageError> {
    stream.send_frame(Frame::Header(header)).await?;
    for chunk in data.chunks(CHUNK_SIZE) {
        stream.send_frame(Frame::Data(chunk.to_vec())).await?;
    }
    stream.send_frame(Frame::EndItem).await
}

pub(crate) async fn send_done(
    stream: &mut dyn VolumeStream,
) -> Result<(), StorageError> {
    stream.send_frame(Frame::Done).await
}

/// Reads the next item, or `None` once the sender finished the stream.
pub(crate) async fn recv_item(
    stream: &mut dyn VolumeStream,
) -> Result<Option<(ItemHeader, Vec<u8>)>, StorageError> {
    let header = match stream.recv_frame().await? {
        Frame::Header(h) => h,
        Frame::Done => return Ok(None),
        other => {
            return Err(StorageError::Protocol(format!(
                "expected item header, got {}",
                describe(&other)
            )))
        }
    };

    let mut data = Vec::new();
    loop {
        match stream.recv_frame().await? {
            Frame::Data(d) => data.extend_from_slice(&d),
            Frame::EndItem => return Ok(Some((header, data))),
            other => {
                return Err(StorageError::Protocol(format!(
                    "expected item data, got {}",
                    describe(&other)
                )))
            }
        }
    }
}

/// Waits for the end of a stream whose items were all consumed.
pub(crate) async fn recv_done(
    stream: &mut dyn VolumeStream,
) -> Result<(), StorageError> {
    match stream.recv_frame().await? {
        Frame::Done => Ok(()),
        other => Err(StorageError::Protocol(format!(
            "expected end of stream, got {}",
            describe(&other)
        ))),
    }
}

pub(crate) fn pack_tar(
    files: &BTreeMap<String, Vec<u8>>,
    compress: bool,
) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, contents.as_slice())?;
    }
    let raw = builder.into_inner()?;

    if !compress {
        return Ok(raw);
    }
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&raw)?;
    enc.finish()
}

/// Unpacks regular files, rejecting any entry whose path is absolute or
/// climbs out of the volume.
pub(crate) fn unpack_tar(
    bytes: &[u8],
    compress: bool,
) -> Result<BTreeMap<String, Vec<u8>>, StorageError> {
    let reader: Box<dyn Read + '_> = if compress {
        Box::new(GzDecoder::new(bytes))
    } else {
        Box::new(bytes)
    };

    let mut files = BTreeMap::new();
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.into_owned();
        let mut parts = Vec::new();
        for c in path.components() {
            match c {
                Component::Normal(p) => {
                    parts.push(p.to_string_lossy().into_owned())
                }
                Component::CurDir => {}
                _ => {
                    return Err(StorageError::Protocol(format!(
                        "tar entry {} leaves the volume",
                        path.display()
                    )))
                }
            }
        }
        if parts.is_empty() {
            return Err(StorageError::Protocol(format!(
                "tar entry {} names no file",
                path.display()
            )));
        }
        let path = parts.join("/");
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        files.insert(path, contents);
    }
    Ok(files)
}

/// Serializes one item's contents in the negotiated format.
pub(crate) fn encode_data(
    mt: &MigrationType,
    data: &VolumeData,
) -> Result<Vec<u8>, StorageError> {
    match (mt.fs_type, data) {
        (MigrationFsType::Memory, d) => ron::ser::to_string(d)
            .map(String::into_bytes)
            .map_err(|e| StorageError::Serialization(e.to_string())),
        (MigrationFsType::Tar, VolumeData::Filesystem(files)) => {
            Ok(pack_tar(files, mt.has_feature(FEATURE_COMPRESS))?)
        }
        (MigrationFsType::Raw, VolumeData::Block(image)) => Ok(image.clone()),
        (t, d) => {
            Err(StorageError::UnsupportedType(t.to_string(), d.content_type()))
        }
    }
}

/// Decodes one item received in the negotiated format, applying it on top
/// of `base` where the format is incremental.
pub(crate) fn decode_data(
    mt: &MigrationType,
    content_type: ContentType,
    bytes: &[u8],
    base: Option<&VolumeData>,
) -> Result<VolumeData, StorageError> {
    let data = match (mt.fs_type, content_type) {
        (MigrationFsType::Memory, _) => {
            let s = std::str::from_utf8(bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            let d: VolumeData = ron::de::from_str(s)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            if d.content_type() != content_type {
                return Err(StorageError::Protocol(format!(
                    "received {:?} data for a {:?} volume",
                    d.content_type(),
                    content_type
                )));
            }
            d
        }
        (MigrationFsType::Tar, ContentType::Filesystem) => {
            let received =
                unpack_tar(bytes, mt.has_feature(FEATURE_COMPRESS))?;
            match base {
                Some(VolumeData::Filesystem(existing))
                    if !mt.has_feature(FEATURE_DELETE) =>
                {
                    let mut merged = existing.clone();
                    merged.extend(received);
                    VolumeData::Filesystem(merged)
                }
                _ => VolumeData::Filesystem(received),
            }
        }
        (MigrationFsType::Raw, ContentType::Block) => {
            VolumeData::Block(bytes.to_vec())
        }
        (t, ct) => {
            return Err(StorageError::UnsupportedType(t.to_string(), ct))
        }
    };
    Ok(data)
}

/// A volume and its snapshots, held in memory while being received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StagedVolume {
    pub data: VolumeData,
    /// Sorted by creation time, oldest first.
    pub snapshots: Vec<(SnapshotInfo, VolumeData)>,
}

impl StagedVolume {
    pub fn new(data: VolumeData) -> Self {
        Self { data, snapshots: Vec::new() }
    }

    pub fn snapshot(&self, name: &str) -> Option<&(SnapshotInfo, VolumeData)> {
        self.snapshots.iter().find(|(i, _)| i.name == name)
    }

    pub fn put_snapshot(&mut self, info: SnapshotInfo, data: VolumeData) {
        self.snapshots.retain(|(i, _)| i.name != info.name);
        self.snapshots.push((info, data));
        self.snapshots.sort_by_key(|(i, _)| i.created_at);
    }

    pub fn remove_snapshots(&mut self, names: &[String]) {
        self.snapshots.retain(|(i, _)| !names.contains(&i.name));
    }
}

/// Picks what an incoming snapshot is decoded on top of: the snapshot
/// planned just before it, else the newest older local snapshot that is
/// being kept, else the current contents.
fn snapshot_base<'a>(
    staged: &'a StagedVolume,
    args: &VolumeTargetArgs,
    planned: usize,
    info: &SnapshotInfo,
) -> &'a VolumeData {
    let previous = planned
        .checked_sub(1)
        .and_then(|i| staged.snapshot(&args.snapshots[i].name));
    let kept = || {
        staged.snapshots.iter().rev().find(|(i, _)| {
            i.created_at < info.created_at
                && !args.delete_snapshots.contains(&i.name)
        })
    };
    previous.or_else(kept).map(|(_, d)| d).unwrap_or(&staged.data)
}

/// Applies every item of a volume stream to `staged`. Only the snapshots
/// listed in `args` are accepted. The volume is decoded on top of its
/// current contents.
pub(crate) async fn receive_into(
    stream: &mut dyn VolumeStream,
    name: &str,
    content_type: ContentType,
    args: &VolumeTargetArgs,
    staged: &mut StagedVolume,
) -> Result<(), StorageError> {
    let mt = &args.migration_type;
    let mut got_volume = false;
    while let Some((header, bytes)) = recv_item(stream).await? {
        match header {
            ItemHeader::Snapshot(info) => {
                check_name(&info.name)?;
                let planned = args
                    .snapshots
                    .iter()
                    .position(|s| s.name == info.name)
                    .ok_or_else(|| {
                        StorageError::Protocol(format!(
                            "snapshot {} of {name} was not requested",
                            info.name
                        ))
                    })?;
                let base = snapshot_base(staged, args, planned, &info);
                let data = decode_data(mt, content_type, &bytes, Some(base))?;
                staged.put_snapshot(info, data);
            }
            ItemHeader::Volume => {
                staged.data =
                    decode_data(mt, content_type, &bytes, Some(&staged.data))?;
                got_volume = true;
            }
            ItemHeader::Checkpoint => {
                return Err(StorageError::Protocol(
                    "checkpoint on a volume stream".to_string(),
                ))
            }
        }
    }

    if !got_volume {
        return Err(StorageError::Protocol(format!(
            "stream for {name} ended without the volume itself"
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_stream {
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::super::{Frame, StorageError, VolumeStream};

    /// One end of an in-process frame pipe.
    pub(crate) struct PipeStream {
        tx: mpsc::UnboundedSender<Frame>,
        rx: mpsc::UnboundedReceiver<Frame>,
    }

    pub(crate) fn pipe() -> (PipeStream, PipeStream) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            PipeStream { tx: a_tx, rx: a_rx },
            PipeStream { tx: b_tx, rx: b_rx },
        )
    }

    #[async_trait]
    impl VolumeStream for PipeStream {
        async fn send_frame(
            &mut self,
            frame: Frame,
        ) -> Result<(), StorageError> {
            self.tx
                .send(frame)
                .map_err(|_| StorageError::Stream("pipe closed".to_string()))
        }

        async fn recv_frame(&mut self) -> Result<Frame, StorageError> {
            self.rx
                .recv()
                .await
                .ok_or_else(|| StorageError::Stream("pipe closed".to_string()))
        }
    }
}

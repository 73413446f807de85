//! Single-object transfer operations: reading a remote object to a host
//! file or directory, and writing a host object to the remote device.
//! Both stream in fixed-size blocks through the cache layer and tear
//! down the remote handle before surfacing any mid-stream failure.

use super::{tidy_args, AsyncHandle, Engine, OpKind, Stage, Status, COPY_SIZE};
use crate::cache::{CacheCmd, CacheCmdKind};
use crate::err::{Error, Result};
use crate::fs::{FileAttr, ObjectType, OpenMode};

fn read_params(eng: &Engine, handle: AsyncHandle) -> Result<(String, String)> {
    match &eng.op(handle)?.kind {
        OpKind::Read { src, dest } => Ok((src.clone(), dest.clone())),
        _ => Err(Error::BadAsyncOp),
    }
}

/// Progress a read operation by a single stage.
pub(super) fn read_stage(
    eng: &mut Engine,
    handle: AsyncHandle,
    err: Option<Error>,
    stage: Stage,
) -> Result<()> {
    let (src, dest) = read_params(eng, handle)?;

    match stage {
        Stage::Initialise => {
            {
                let op = eng.op_mut(handle)?;
                op.suspend = true;
                op.host = None;
                op.remote = None;
            }
            eng.hostfs.wipe(&dest);
            if let Some(err) = err {
                return Err(err);
            }
            {
                let op = eng.op_mut(handle)?;
                op.status = Status::CatRead;
                op.detail = tidy_args(&src);
            }
            eng.cache_submit(handle, CacheCmd::Info { path: src })
        }

        Stage::Process => {
            let err = eng.op_mut(handle)?.restore_error(err);
            let result = read_process(eng, handle, err, &src, &dest);
            finish_or_teardown(eng, handle, result)
        }

        Stage::Abort => {
            let err = eng.op_mut(handle)?.restore_error(err);
            let remote = eng.op(handle)?.remote;
            match remote {
                Some(remote) => {
                    eng.op_mut(handle)?.store_error(err);
                    {
                        let op = eng.op_mut(handle)?;
                        op.status = Status::FileClose;
                        op.remote = None;
                    }
                    eng.cache_submit(handle, CacheCmd::Close { handle: remote })
                }
                None => match err {
                    Some(err) => Err(err),
                    None => {
                        eng.op_mut(handle)?.status = Status::Aborted;
                        Ok(())
                    }
                },
            }
        }

        Stage::PreFinalise => {
            let mut err = err;
            if let Some(host) = eng.op_mut(handle)?.host.take() {
                let _ = eng.hostfs.close(host);
            }
            let abort = eng.op(handle)?.abort;
            if err.is_none() && !abort {
                // Apply the catalogue information to the completed copy.
                let info = eng.op(handle)?.info.clone();
                err = eng
                    .hostfs
                    .set_stamp(&dest, info.load_addr, info.exec_addr)
                    .and_then(|_| eng.hostfs.set_attr(&dest, info.attr))
                    .err();
            }
            if err.is_some() || abort {
                eng.hostfs.wipe(&dest);
            }
            match err {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        Stage::PostFinalise => match err {
            Some(err) => Err(err),
            None => Ok(()),
        },
    }
}

/// The process-stage body for a read; any error the caller converts to a
/// remote-handle teardown.
fn read_process(
    eng: &mut Engine,
    handle: AsyncHandle,
    err: Option<Error>,
    src: &str,
    dest: &str,
) -> Result<()> {
    if let Some(err) = err {
        return Err(err);
    }
    match eng.op(handle)?.last_cache {
        Some(CacheCmdKind::Info) => {
            let reply = eng.op_mut(handle)?.cache_reply.take().ok_or(Error::BadParms)?;
            let info = reply.into_info()?;
            eng.op_mut(handle)?.info = info.clone();
            match info.obj_type {
                ObjectType::NotFound => Err(Error::NotFound),
                ObjectType::Dir => {
                    eng.hostfs.create_dir(dest)?;
                    eng.op_mut(handle)?.status = Status::Success;
                    Ok(())
                }
                ObjectType::File => {
                    let host = eng.hostfs.open_out(dest)?;
                    {
                        let op = eng.op_mut(handle)?;
                        op.host = Some(host);
                        op.status = Status::FileOpen;
                    }
                    eng.cache_submit(
                        handle,
                        CacheCmd::Open {
                            path: src.to_string(),
                            mode: OpenMode::In,
                        },
                    )
                }
            }
        }

        Some(CacheCmdKind::Close) => {
            let op = eng.op_mut(handle)?;
            op.remote = None;
            op.status = Status::Success;
            Ok(())
        }

        Some(CacheCmdKind::Open) | Some(CacheCmdKind::Read) => {
            if eng.op(handle)?.last_cache == Some(CacheCmdKind::Open) {
                let reply = eng.op_mut(handle)?.cache_reply.take().ok_or(Error::BadParms)?;
                let remote = reply.into_handle()?;
                let op = eng.op_mut(handle)?;
                op.remote = Some(remote);
                op.xfer_offset = 0;
                op.xfer_len = COPY_SIZE;
            } else {
                // A block arrived; append it to the host file.
                let reply = eng.op_mut(handle)?.cache_reply.take().ok_or(Error::BadParms)?;
                let data = reply.into_data()?;
                let host = eng.op(handle)?.host.ok_or(Error::BadParms)?;
                eng.hostfs.write(host, &data)?;
                let op = eng.op_mut(handle)?;
                op.xfer_offset += op.xfer_len as u32;
            }
            let (offset, mut length, size, remote) = {
                let op = eng.op(handle)?;
                (
                    op.xfer_offset,
                    op.xfer_len,
                    op.info.size,
                    op.remote.ok_or(Error::BadParms)?,
                )
            };
            if offset < size {
                // Read the next block of data.
                if ((size - offset) as usize) < length {
                    length = (size - offset) as usize;
                }
                {
                    let op = eng.op_mut(handle)?;
                    op.status = Status::FileRead;
                    op.xfer_len = length;
                }
                eng.cache_submit(
                    handle,
                    CacheCmd::Read {
                        handle: remote,
                        offset,
                        length,
                    },
                )?;
                eng.mark(handle, offset, size - offset, length as u32)
            } else {
                // Close the input file when finished.
                {
                    let op = eng.op_mut(handle)?;
                    op.status = Status::FileClose;
                }
                eng.cache_submit(handle, CacheCmd::Close { handle: remote })
            }
        }

        _ => Err(Error::BadAsyncState),
    }
}

/// Convert a process-stage failure into a teardown of the open remote
/// handle, parking the failure until the close completes.
fn finish_or_teardown(
    eng: &mut Engine,
    handle: AsyncHandle,
    result: Result<()>,
) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            let remote = eng.op(handle)?.remote;
            match remote {
                Some(remote) => {
                    eng.op_mut(handle)?.store_error(Some(err));
                    {
                        let op = eng.op_mut(handle)?;
                        op.status = Status::FileClose;
                        op.remote = None;
                    }
                    eng.cache_submit(handle, CacheCmd::Close { handle: remote })
                }
                None => Err(err),
            }
        }
    }
}

fn write_params(eng: &Engine, handle: AsyncHandle) -> Result<(String, String, bool)> {
    match &eng.op(handle)?.kind {
        OpKind::Write { src, dest, remove } => Ok((src.clone(), dest.clone(), *remove)),
        _ => Err(Error::BadAsyncOp),
    }
}

/// Progress a write operation by a single stage.
pub(super) fn write_stage(
    eng: &mut Engine,
    handle: AsyncHandle,
    err: Option<Error>,
    stage: Stage,
) -> Result<()> {
    let (src, dest, remove) = write_params(eng, handle)?;

    match stage {
        Stage::Initialise => {
            {
                let op = eng.op_mut(handle)?;
                op.suspend = true;
                op.host = None;
                op.remote = None;
            }
            if let Some(err) = err {
                return Err(err);
            }
            let info = eng.hostfs.info(&src)?;
            if info.obj_type == ObjectType::NotFound {
                return Err(Error::NotFound);
            }
            {
                let op = eng.op_mut(handle)?;
                op.info = info;
                op.status = Status::CatRead;
                op.detail = tidy_args(&dest);
            }
            eng.cache_submit(handle, CacheCmd::Info { path: dest })
        }

        Stage::Process => {
            let err = eng.op_mut(handle)?.restore_error(err);
            let result = write_process(eng, handle, err, &src, &dest);
            finish_or_teardown(eng, handle, result)
        }

        Stage::Abort => {
            let err = eng.op_mut(handle)?.restore_error(err);
            let remote = eng.op(handle)?.remote;
            match remote {
                Some(remote) => {
                    eng.op_mut(handle)?.store_error(err);
                    {
                        let op = eng.op_mut(handle)?;
                        op.status = Status::FileClose;
                        op.remote = None;
                    }
                    eng.cache_submit(handle, CacheCmd::Close { handle: remote })
                }
                None => match err {
                    Some(err) => Err(err),
                    None => {
                        eng.op_mut(handle)?.status = Status::Aborted;
                        Ok(())
                    }
                },
            }
        }

        Stage::PreFinalise => {
            if let Some(host) = eng.op_mut(handle)?.host.take() {
                let _ = eng.hostfs.close(host);
            }
            if remove {
                eng.hostfs.wipe(&src);
            }
            match err {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        Stage::PostFinalise => match err {
            Some(err) => Err(err),
            None => Ok(()),
        },
    }
}

fn write_process(
    eng: &mut Engine,
    handle: AsyncHandle,
    err: Option<Error>,
    src: &str,
    dest: &str,
) -> Result<()> {
    if let Some(err) = err {
        return Err(err);
    }
    match eng.op(handle)?.last_cache {
        Some(CacheCmdKind::Info) => {
            let reply = eng.op_mut(handle)?.cache_reply.take().ok_or(Error::BadParms)?;
            let existing = reply.into_info()?.obj_type;
            eng.op_mut(handle)?.existing = existing;
            if existing == ObjectType::NotFound {
                // Skip straight to creating the new object.
                let op = eng.op_mut(handle)?;
                op.last_cache = Some(CacheCmdKind::Remove);
                op.status = Status::Busy;
                Ok(())
            } else {
                // Unlock the existing object first.
                eng.op_mut(handle)?.status = Status::CatWrite;
                eng.cache_submit(
                    handle,
                    CacheCmd::Access {
                        path: dest.to_string(),
                        attr: FileAttr::OWNER_READ | FileAttr::OWNER_WRITE,
                    },
                )
            }
        }

        Some(CacheCmdKind::Access) => {
            let existing = eng.op(handle)?.existing;
            let is_dir = eng.op(handle)?.info.obj_type == ObjectType::Dir;
            let result = if existing == ObjectType::NotFound {
                // The final step was setting the attributes.
                eng.op_mut(handle)?.status = Status::Success;
                Ok(())
            } else if existing == ObjectType::Dir && is_dir {
                // Just the date stamp and attributes need changing.
                let op = eng.op_mut(handle)?;
                op.last_cache = Some(CacheCmdKind::MkDir);
                op.status = Status::Busy;
                Ok(())
            } else if existing != ObjectType::Dir && !is_dir {
                // Overwrite the existing file in place.
                let op = eng.op_mut(handle)?;
                op.last_cache = Some(CacheCmdKind::Remove);
                op.status = Status::Busy;
                Ok(())
            } else {
                // Replace a file with a directory or vice versa.
                eng.op_mut(handle)?.status = Status::FileDelete;
                eng.cache_submit(
                    handle,
                    CacheCmd::Remove {
                        path: dest.to_string(),
                    },
                )
            };
            eng.op_mut(handle)?.existing = ObjectType::NotFound;
            result
        }

        Some(CacheCmdKind::Remove) => {
            if eng.op(handle)?.info.obj_type == ObjectType::Dir {
                eng.op_mut(handle)?.status = Status::FileMkDir;
                eng.cache_submit(
                    handle,
                    CacheCmd::MkDir {
                        path: dest.to_string(),
                    },
                )
            } else {
                let host = eng.hostfs.open_in(src)?;
                {
                    let op = eng.op_mut(handle)?;
                    op.host = Some(host);
                    op.status = Status::FileOpen;
                }
                eng.cache_submit(
                    handle,
                    CacheCmd::Open {
                        path: dest.to_string(),
                        mode: OpenMode::Out,
                    },
                )
            }
        }

        Some(CacheCmdKind::Open) => {
            let reply = eng.op_mut(handle)?.cache_reply.take().ok_or(Error::BadParms)?;
            let remote = reply.into_handle()?;
            let size = eng.op(handle)?.info.size;
            {
                let op = eng.op_mut(handle)?;
                op.remote = Some(remote);
                op.status = Status::FileWrite;
            }
            eng.cache_submit(handle, CacheCmd::Extent { handle: remote, size })
        }

        Some(CacheCmdKind::Extent) | Some(CacheCmdKind::Write) => {
            if eng.op(handle)?.last_cache == Some(CacheCmdKind::Extent) {
                let op = eng.op_mut(handle)?;
                op.xfer_offset = 0;
                op.xfer_len = COPY_SIZE;
            } else {
                let op = eng.op_mut(handle)?;
                op.xfer_offset += op.xfer_len as u32;
            }
            let (offset, mut length, size, remote) = {
                let op = eng.op(handle)?;
                (
                    op.xfer_offset,
                    op.xfer_len,
                    op.info.size,
                    op.remote.ok_or(Error::BadParms)?,
                )
            };
            if offset < size {
                if ((size - offset) as usize) < length {
                    length = (size - offset) as usize;
                }
                let host = eng.op(handle)?.host.ok_or(Error::BadParms)?;
                let data = eng.hostfs.read(host, length)?;
                {
                    let op = eng.op_mut(handle)?;
                    op.status = Status::FileWrite;
                    op.xfer_len = length;
                }
                eng.cache_submit(
                    handle,
                    CacheCmd::Write {
                        handle: remote,
                        offset,
                        data,
                    },
                )?;
                eng.mark(handle, offset, size - offset, length as u32)
            } else {
                eng.op_mut(handle)?.status = Status::FileClose;
                eng.cache_submit(handle, CacheCmd::Close { handle: remote })
            }
        }

        Some(CacheCmdKind::MkDir) | Some(CacheCmdKind::Close) => {
            // Object created, so set the date stamp.
            let info = eng.op(handle)?.info.clone();
            {
                let op = eng.op_mut(handle)?;
                op.remote = None;
                op.status = Status::CatWrite;
            }
            eng.cache_submit(
                handle,
                CacheCmd::Stamp {
                    path: dest.to_string(),
                    load: info.load_addr,
                    exec: info.exec_addr,
                },
            )
        }

        Some(CacheCmdKind::Stamp) => {
            let attr = eng.op(handle)?.info.attr;
            eng.op_mut(handle)?.status = Status::CatWrite;
            eng.cache_submit(
                handle,
                CacheCmd::Access {
                    path: dest.to_string(),
                    attr,
                },
            )
        }

        _ => Err(Error::BadAsyncState),
    }
}

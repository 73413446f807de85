//! Backup of a remote directory tree. The composite operation delegates
//! three phases in turn: walking the remote tree into an index, diffing
//! the previous backup archive against the index (reusing unchanged
//! entries and prompting where the previous copy is newer), and reading
//! whatever is still live into the new archive.

use super::{
    tidy_args, AsyncHandle, Engine, OpKind, Response, Stage, Status, FILE_SIZE_WEIGHT,
    FILE_WEIGHT, MIN_FILES, TAR_SIZE_WEIGHT, TAR_WEIGHT,
};
use crate::backtree::{BackTree, BackTreeResult};
use crate::cache::{CacheCmd, CacheReply};
use crate::err::{Error, Result};
use crate::frac::Frac;
use crate::fs::{ObjectType, CHAR_SEPARATOR, MAX_PATH};

/// Progress units for a set of files and their total size in the archive
/// phase.
fn tar_units(files: u32, size: u32) -> u32 {
    files
        .saturating_mul(TAR_WEIGHT)
        .saturating_add(size.saturating_mul(TAR_SIZE_WEIGHT))
}

/// Progress units for the transfer-then-archive phase.
fn copy_units(files: u32, size: u32) -> u32 {
    files
        .saturating_mul(FILE_WEIGHT)
        .saturating_add(size.saturating_mul(FILE_SIZE_WEIGHT))
        .saturating_add(tar_units(files, size))
}

fn backup_params(
    eng: &Engine,
    handle: AsyncHandle,
) -> Result<(String, String, String, String, String)> {
    match &eng.op(handle)?.kind {
        OpKind::Backup {
            src,
            dest,
            prev,
            scrap,
            temp,
        } => Ok((
            src.clone(),
            dest.clone(),
            prev.clone(),
            scrap.clone(),
            temp.clone(),
        )),
        _ => Err(Error::BadAsyncOp),
    }
}

pub(super) fn backup_stage(
    eng: &mut Engine,
    handle: AsyncHandle,
    err: Option<Error>,
    stage: Stage,
) -> Result<()> {
    let (src, dest, prev, scrap, temp) = backup_params(eng, handle)?;

    match stage {
        Stage::Initialise => {
            if let Some(err) = err {
                return Err(err);
            }
            let tree = BackTree::create();
            eng.op_mut(handle)?.tree = Some(tree.clone_handle());
            eng.hostfs.wipe(&dest);
            if !scrap.is_empty() {
                eng.hostfs.wipe(&scrap);
            }
            eng.hostfs.wipe(&temp);
            {
                let op = eng.op_mut(handle)?;
                op.index = 0;
                op.recurse = true;
                op.status = Status::Delegate;
            }
            eng.new_op(
                Some(handle),
                OpKind::BackupList {
                    tree,
                    src,
                    sub: String::new(),
                },
            )?;
            eng.mark(handle, 0, 40, 2)
        }

        Stage::Process => {
            if let Some(err) = err {
                return Err(err);
            }
            eng.op_mut(handle)?.index += 1;
            let index = eng.op(handle)?.index;
            let tree = eng.op(handle)?.tree.clone().ok_or(Error::BadAsyncState)?;
            if index == 1 {
                // The index is built; process the previous backup.
                eng.op_mut(handle)?.status = Status::Delegate;
                eng.new_op(
                    Some(handle),
                    OpKind::BackupPrev {
                        tree: tree.clone_handle(),
                        src,
                        dest,
                        prev,
                        scrap,
                    },
                )?;
                let (files, size) = tree.count();
                eng.op_mut(handle)?.num = tar_units(files, size);
                eng.mark(handle, 2, 38, 3)
            } else if index == 2 {
                // Previous backup processed; copy the remaining files.
                eng.op_mut(handle)?.status = Status::Delegate;
                eng.new_op(
                    Some(handle),
                    OpKind::BackupCopy {
                        tree: tree.clone_handle(),
                        src,
                        dest,
                        temp,
                    },
                )?;
                let (files, size) = tree.count();
                // Scale the remaining nominal units by the ratio of the
                // first phase's units to the whole copy phase.
                let whole = copy_units(files, size);
                let num = eng.op(handle)?.num;
                let scaled = Frac::create(num, whole).inv_scale(3);
                eng.mark(handle, 5, scaled, scaled)
            } else {
                eng.op_mut(handle)?.status = Status::Success;
                Ok(())
            }
        }

        Stage::Abort => match err {
            Some(err) => Err(err),
            None => {
                eng.op_mut(handle)?.status = Status::Aborted;
                Ok(())
            }
        },

        Stage::PreFinalise => {
            if let Some(child) = eng.op(handle)?.child {
                eng.abort_op(child)?;
            }
            eng.op_mut(handle)?.tree = None;
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

fn list_params(eng: &Engine, handle: AsyncHandle) -> Result<(BackTree, String, String)> {
    match &eng.op(handle)?.kind {
        OpKind::BackupList { tree, src, sub } => {
            Ok((tree.clone_handle(), src.clone(), sub.clone()))
        }
        _ => Err(Error::BadAsyncOp),
    }
}

pub(super) fn list_stage(
    eng: &mut Engine,
    handle: AsyncHandle,
    err: Option<Error>,
    stage: Stage,
) -> Result<()> {
    let (parent_tree, src, sub) = list_params(eng, handle)?;

    match stage {
        Stage::Initialise => {
            if let Some(err) = err {
                return Err(err);
            }
            let tree = parent_tree.clone_handle();
            let path = if sub.is_empty() {
                src.clone()
            } else {
                format!("{}{}{}", src, CHAR_SEPARATOR, sub)
            };
            if MAX_PATH <= path.len() {
                return Err(Error::BadName);
            }
            {
                let op = eng.op_mut(handle)?;
                op.tree = Some(tree);
                op.index = 0;
                op.num = 0;
                op.cursor = 0;
                op.status = Status::CatRead;
                op.detail = tidy_args(&path);
                op.enum_size = MIN_FILES;
            }
            eng.cache_submit(
                handle,
                CacheCmd::Enumerate {
                    path,
                    pattern: "*".to_string(),
                    offset: 0,
                    size: MIN_FILES,
                },
            )
        }

        Stage::Process => {
            if let Some(err) = err {
                return Err(err);
            }
            let num = eng.op(handle)?.num;
            if num == 0 {
                let reply = eng.op_mut(handle)?.cache_reply.take();
                let (entries, resume) = match reply {
                    Some(CacheReply::Enumerate { entries, resume }) => (entries, resume),
                    _ => return Err(Error::BadParms),
                };
                if resume.is_some() {
                    // Buffer too small to read all entries in one go.
                    let (path, size) = {
                        let op = eng.op_mut(handle)?;
                        op.status = Status::CatRead;
                        op.enum_size *= 2;
                        let path = if sub.is_empty() {
                            src.clone()
                        } else {
                            format!("{}{}{}", src, CHAR_SEPARATOR, sub)
                        };
                        (path, op.enum_size)
                    };
                    return eng.cache_submit(
                        handle,
                        CacheCmd::Enumerate {
                            path,
                            pattern: "*".to_string(),
                            offset: 0,
                            size,
                        },
                    );
                }

                // Directory contents read: index every entry, counting
                // the subdirectories for the recursion below.
                let tree = eng.op(handle)?.tree.clone().ok_or(Error::BadAsyncState)?;
                let mut indexed = Vec::with_capacity(entries.len());
                let mut dirs = 0;
                for mut entry in entries {
                    if !sub.is_empty() {
                        let prefixed =
                            format!("{}{}{}", sub, CHAR_SEPARATOR, entry.name);
                        if MAX_PATH <= prefixed.len() {
                            return Err(Error::BadName);
                        }
                        entry.name = prefixed;
                    }
                    tree.add(&entry)?;
                    if entry.obj_type == ObjectType::Dir {
                        dirs += 1;
                    }
                    indexed.push(entry);
                }
                {
                    let op = eng.op_mut(handle)?;
                    op.entries = indexed;
                    op.index = 0;
                    op.num = dirs;
                    if dirs == 0 {
                        op.status = Status::Success;
                        return Ok(());
                    }
                }
            }

            let (index, num) = {
                let op = eng.op(handle)?;
                (op.index, op.num)
            };
            if index < num {
                // Recurse through the next subdirectory.
                let sub_name = {
                    let op = eng.op_mut(handle)?;
                    while op
                        .entries
                        .get(op.cursor)
                        .map_or(false, |e| e.obj_type != ObjectType::Dir)
                    {
                        op.cursor += 1;
                    }
                    let entry = op.entries.get(op.cursor).ok_or(Error::BadAsyncState)?;
                    entry.name.clone()
                };
                let tree = eng.op(handle)?.tree.clone().ok_or(Error::BadAsyncState)?;
                {
                    let op = eng.op_mut(handle)?;
                    op.recurse = true;
                    op.status = Status::Delegate;
                }
                eng.new_op(
                    Some(handle),
                    OpKind::BackupList {
                        tree,
                        src,
                        sub: sub_name,
                    },
                )?;
                let index = {
                    let op = eng.op_mut(handle)?;
                    op.index += 1;
                    op.cursor += 1;
                    op.index
                };
                eng.mark(handle, index, num + 1 - index, 1)
            } else {
                eng.op_mut(handle)?.status = Status::Success;
                Ok(())
            }
        }

        Stage::Abort => match err {
            Some(err) => Err(err),
            None => {
                eng.op_mut(handle)?.status = Status::Aborted;
                Ok(())
            }
        },

        Stage::PreFinalise => {
            if let Some(child) = eng.op(handle)?.child {
                eng.abort_op(child)?;
            }
            eng.op_mut(handle)?.tree = None;
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

fn prev_params(
    eng: &Engine,
    handle: AsyncHandle,
) -> Result<(BackTree, String, String, String, String)> {
    match &eng.op(handle)?.kind {
        OpKind::BackupPrev {
            tree,
            src,
            dest,
            prev,
            scrap,
        } => Ok((
            tree.clone_handle(),
            src.clone(),
            dest.clone(),
            prev.clone(),
            scrap.clone(),
        )),
        _ => Err(Error::BadAsyncOp),
    }
}

pub(super) fn prev_stage(
    eng: &mut Engine,
    handle: AsyncHandle,
    err: Option<Error>,
    stage: Stage,
) -> Result<()> {
    let (parent_tree, src, dest, prev, scrap) = prev_params(eng, handle)?;

    match stage {
        Stage::Initialise => {
            if let Some(err) = err {
                return Err(err);
            }
            if prev.is_empty() {
                // Nothing to diff against; the whole tree is copied
                // fresh.
                eng.op_mut(handle)?.status = Status::Success;
                return Ok(());
            }
            let tree = parent_tree.clone_handle();
            let prev_tar = eng.tar.open_in(&prev)?;
            eng.op_mut(handle)?.prev_tar = Some(prev_tar);
            if !scrap.is_empty() {
                let scrap_tar = eng.tar.open_out(&scrap, false)?;
                eng.op_mut(handle)?.scrap_tar = Some(scrap_tar);
            }
            let dest_tar = eng.tar.open_out(&dest, false)?;
            {
                let op = eng.op_mut(handle)?;
                op.dest_tar = Some(dest_tar);
                op.tree = Some(tree);
                op.response = Response::Continue;
            }
            Ok(())
        }

        Stage::Process => {
            if let Some(err) = err {
                return Err(err);
            }
            {
                let op = eng.op_mut(handle)?;
                if op.response == Response::Quiet {
                    // Once silenced, both older and newer files are
                    // replaced without further prompts.
                    op.quiet = true;
                    op.response = Response::Copy;
                }
            }

            let response = eng.op(handle)?.response;
            let mut delegate_status = None;
            match response {
                Response::Copy => {
                    eng.op_mut(handle)?.response = Response::Continue;
                    let prev_tar = eng.op(handle)?.prev_tar.ok_or(Error::BadAsyncState)?;
                    match eng.op(handle)?.scrap_tar {
                        Some(scrap_tar) => {
                            delegate_status = Some(Status::TarScrap);
                            eng.tar.copy(prev_tar, scrap_tar)?;
                        }
                        None => {
                            eng.tar.skip(prev_tar)?;
                        }
                    }
                }
                Response::Skip => {
                    // Keep the previous copy: forward it to the new
                    // archive and drop the entry from the index.
                    eng.op_mut(handle)?.response = Response::Continue;
                    let (prev_tar, dest_tar) = {
                        let op = eng.op(handle)?;
                        (
                            op.prev_tar.ok_or(Error::BadAsyncState)?,
                            op.dest_tar.ok_or(Error::BadAsyncState)?,
                        )
                    };
                    delegate_status = Some(Status::TarKeep);
                    eng.tar.copy(prev_tar, dest_tar)?;
                    let tree = eng.op(handle)?.tree.clone().ok_or(Error::BadAsyncState)?;
                    let info = eng.op(handle)?.info.clone();
                    tree.ignore(&info)?;
                }
                Response::Continue => {
                    let prev_tar = eng.op(handle)?.prev_tar.ok_or(Error::BadAsyncState)?;
                    match eng.tar.info(prev_tar)? {
                        Some(info) => {
                            let full =
                                format!("{}{}{}", src, CHAR_SEPARATOR, info.name);
                            if MAX_PATH <= full.len() {
                                return Err(Error::BadName);
                            }
                            eng.op_mut(handle)?.detail = tidy_args(&full);
                            eng.op_mut(handle)?.info = info.clone();
                            let pos = eng.tar.position(prev_tar)?;
                            eng.mark(handle, pos.done, pos.remain, pos.step)?;
                            let tree =
                                eng.op(handle)?.tree.clone().ok_or(Error::BadAsyncState)?;
                            match tree.check(&info) {
                                BackTreeResult::Same => {
                                    eng.op_mut(handle)?.response = Response::Skip;
                                }
                                BackTreeResult::Newer if !eng.op(handle)?.quiet => {
                                    eng.op_mut(handle)?.status = Status::WaitNewer;
                                }
                                _ => {
                                    eng.op_mut(handle)?.response = Response::Copy;
                                }
                            }
                        }
                        None => {
                            eng.op_mut(handle)?.status = Status::Success;
                        }
                    }
                }
                _ => (),
            }

            if let Some(tar_status) = delegate_status {
                let prev_tar = eng.op(handle)?.prev_tar.ok_or(Error::BadAsyncState)?;
                let detail = eng.op(handle)?.detail.clone();
                {
                    let op = eng.op_mut(handle)?;
                    op.recurse = true;
                    op.status = Status::Delegate;
                }
                eng.new_op(
                    Some(handle),
                    OpKind::TarComplete {
                        handle: prev_tar,
                        status: tar_status,
                        detail,
                    },
                )?;
            }
            Ok(())
        }

        Stage::Abort => match err {
            Some(err) => Err(err),
            None => {
                eng.op_mut(handle)?.status = Status::Aborted;
                Ok(())
            }
        },

        Stage::PreFinalise => {
            let success = eng.op(handle)?.status == Status::Success;
            if let Some(dest_tar) = eng.op_mut(handle)?.dest_tar.take() {
                let _ = eng.tar.close(dest_tar);
                if !success {
                    eng.hostfs.wipe(&dest);
                }
            }
            if let Some(scrap_tar) = eng.op_mut(handle)?.scrap_tar.take() {
                let _ = eng.tar.close(scrap_tar);
                if !success {
                    eng.hostfs.wipe(&scrap);
                }
            }
            if let Some(prev_tar) = eng.op_mut(handle)?.prev_tar.take() {
                let _ = eng.tar.close(prev_tar);
            }
            eng.op_mut(handle)?.tree = None;
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

fn copy_params(
    eng: &Engine,
    handle: AsyncHandle,
) -> Result<(BackTree, String, String, String)> {
    match &eng.op(handle)?.kind {
        OpKind::BackupCopy {
            tree,
            src,
            dest,
            temp,
        } => Ok((tree.clone_handle(), src.clone(), dest.clone(), temp.clone())),
        _ => Err(Error::BadAsyncOp),
    }
}

pub(super) fn copy_stage(
    eng: &mut Engine,
    handle: AsyncHandle,
    err: Option<Error>,
    stage: Stage,
) -> Result<()> {
    let (parent_tree, src, dest, temp) = copy_params(eng, handle)?;

    match stage {
        Stage::Initialise => {
            if let Some(err) = err {
                return Err(err);
            }
            let tree = parent_tree.clone_handle();
            let dest_tar = eng.tar.open_out(&dest, true)?;
            let (files, size) = tree.count();
            {
                let op = eng.op_mut(handle)?;
                op.dest_tar = Some(dest_tar);
                op.tree = Some(tree);
                op.index = 0;
                op.num = copy_units(files, size);
                op.response = Response::Continue;
            }
            Ok(())
        }

        Stage::Process => {
            if let Some(err) = err {
                // A failed read becomes a prompt rather than a failure
                // of the whole backup.
                let child_is_read = match eng.op(handle)?.child {
                    Some(child) => {
                        matches!(eng.op(child)?.kind, OpKind::Read { .. })
                    }
                    None => false,
                };
                if child_is_read {
                    let op = eng.op_mut(handle)?;
                    op.status = Status::WaitRead;
                    op.wait_err = Some(err);
                    return Ok(());
                }
                return Err(err);
            }

            let response = eng.op(handle)?.response;
            match response {
                Response::Skip => {
                    // Give up on the file that failed.
                    eng.op_mut(handle)?.response = Response::Continue;
                    let tree = eng.op(handle)?.tree.clone().ok_or(Error::BadAsyncState)?;
                    let info = eng.op(handle)?.info.clone();
                    tree.ignore(&info)?;
                    Ok(())
                }

                Response::Retry => {
                    // Run the failed read again with the same parameters.
                    let child = eng.op(handle)?.child.ok_or(Error::BadAsyncState)?;
                    let kind = eng.op(child)?.kind.clone();
                    {
                        let op = eng.op_mut(handle)?;
                        op.response = Response::Copy;
                        op.status = Status::Delegate;
                    }
                    eng.new_op(Some(handle), kind)?;
                    Ok(())
                }

                Response::Copy => {
                    // The file has been read into the staging copy; add
                    // it to the archive.
                    eng.op_mut(handle)?.response = Response::Continue;
                    if let Some(child) = eng.op(handle)?.child {
                        eng.abort_op(child)?;
                    }
                    let tree = eng.op(handle)?.tree.clone().ok_or(Error::BadAsyncState)?;
                    let info = eng.op(handle)?.info.clone();
                    tree.ignore(&info)?;
                    let dest_tar = eng.op(handle)?.dest_tar.ok_or(Error::BadAsyncState)?;
                    eng.tar.add(&temp, &info.name, dest_tar)?;
                    let detail = eng.op(handle)?.detail.clone();
                    {
                        let op = eng.op_mut(handle)?;
                        op.recurse = true;
                        op.status = Status::Delegate;
                    }
                    eng.new_op(
                        Some(handle),
                        OpKind::TarComplete {
                            handle: dest_tar,
                            status: Status::TarAdd,
                            detail,
                        },
                    )?;
                    let weight = TAR_WEIGHT.saturating_add(
                        if info.obj_type != ObjectType::Dir {
                            info.size.saturating_mul(TAR_SIZE_WEIGHT)
                        } else {
                            0
                        },
                    );
                    let (index, num) = {
                        let op = eng.op(handle)?;
                        (op.index, op.num)
                    };
                    eng.mark(handle, index, num.saturating_sub(index).max(weight), weight)?;
                    eng.op_mut(handle)?.index = index.saturating_add(weight);
                    Ok(())
                }

                Response::Continue => {
                    let tree = eng.op(handle)?.tree.clone().ok_or(Error::BadAsyncState)?;
                    match tree.enumerate() {
                        Some(info) => {
                            let src_path =
                                format!("{}{}{}", src, CHAR_SEPARATOR, info.name);
                            if MAX_PATH <= src_path.len() {
                                return Err(Error::BadName);
                            }
                            {
                                let op = eng.op_mut(handle)?;
                                op.response = Response::Copy;
                                op.info = info.clone();
                                op.recurse = true;
                                op.status = Status::Delegate;
                                op.detail = tidy_args(&src_path);
                            }
                            eng.new_op(
                                Some(handle),
                                OpKind::Read {
                                    src: src_path,
                                    dest: temp.clone(),
                                },
                            )?;
                            let weight = FILE_WEIGHT.saturating_add(
                                if info.obj_type != ObjectType::Dir {
                                    info.size.saturating_mul(FILE_SIZE_WEIGHT)
                                } else {
                                    0
                                },
                            );
                            let (index, num) = {
                                let op = eng.op(handle)?;
                                (op.index, op.num)
                            };
                            eng.mark(
                                handle,
                                index,
                                num.saturating_sub(index).max(weight),
                                weight,
                            )?;
                            eng.op_mut(handle)?.index = index.saturating_add(weight);
                            Ok(())
                        }
                        None => {
                            eng.op_mut(handle)?.status = Status::Success;
                            Ok(())
                        }
                    }
                }

                Response::Quiet => Ok(()),
            }
        }

        Stage::Abort => match err {
            Some(err) => Err(err),
            None => {
                eng.op_mut(handle)?.status = Status::Aborted;
                Ok(())
            }
        },

        Stage::PreFinalise => {
            if let Some(child) = eng.op(handle)?.child {
                eng.abort_op(child)?;
            }
            if let Some(dest_tar) = eng.op_mut(handle)?.dest_tar.take() {
                let _ = eng.tar.close(dest_tar);
            }
            eng.op_mut(handle)?.tree = None;
            eng.hostfs.wipe(&temp);
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

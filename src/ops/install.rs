//! Run-oriented operations: writing a file to the remote device and
//! starting it, installing a package (fetching the installer first when
//! it is absent from every drive), and the drive-scanning find that the
//! installer search uses.

use super::{tidy_args, AsyncHandle, Engine, OpKind, Stage, Status, CLOSE_DELAY};
use crate::cache::{CacheCmd, CacheReply};
use crate::err::{Error, Result};
use crate::fs::{
    ObjectType, CHAR_DISC, CHAR_DRIVE_ALL, CHAR_ROOT, CHAR_SEPARATOR, DRIVE_FIRST, DRIVE_LAST,
};
use crate::unified::{StartAction, UnifiedCmd};

fn write_start_params(
    eng: &Engine,
    handle: AsyncHandle,
) -> Result<(String, String, String, bool)> {
    match &eng.op(handle)?.kind {
        OpKind::WriteStart {
            src,
            dest,
            exe,
            remove,
        } => Ok((src.clone(), dest.clone(), exe.clone(), *remove)),
        _ => Err(Error::BadAsyncOp),
    }
}

pub(super) fn write_start_stage(
    eng: &mut Engine,
    handle: AsyncHandle,
    err: Option<Error>,
    stage: Stage,
) -> Result<()> {
    let (src, dest, exe, remove) = write_start_params(eng, handle)?;

    match stage {
        Stage::Initialise => {
            if let Some(err) = err {
                return Err(err);
            }
            {
                let op = eng.op_mut(handle)?;
                op.suspend = true;
                op.recurse = true;
                op.status = Status::Delegate;
                op.index = 0;
            }
            eng.new_op(Some(handle), OpKind::Write { src, dest, remove })?;
            eng.mark(handle, 0, 100, 85)
        }

        Stage::Process => {
            if let Some(err) = err {
                return Err(err);
            }
            eng.op_mut(handle)?.index += 1;
            match eng.op(handle)?.index {
                1 => {
                    // Allow the remote end to settle after the close.
                    {
                        let op = eng.op_mut(handle)?;
                        op.status = Status::FileClose;
                        op.detail = tidy_args(&dest);
                    }
                    eng.timer_submit(handle, CLOSE_DELAY);
                    eng.mark(handle, 85, 15, 5)
                }
                2 => {
                    // Start the written file, either directly or through
                    // the nominated executable.
                    eng.op_mut(handle)?.status = Status::ProgOpen;
                    let (name, args, action) = if !exe.is_empty() {
                        (exe.clone(), dest.clone(), StartAction::Open)
                    } else {
                        (dest.clone(), String::new(), StartAction::Default)
                    };
                    eng.detail_app(handle, &name, &args)?;
                    eng.unified_submit(handle, UnifiedCmd::Start { name, args, action })?;
                    eng.mark(handle, 90, 10, 10)
                }
                _ => {
                    eng.op_mut(handle)?.status = Status::Success;
                    Ok(())
                }
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

fn install_params(
    eng: &Engine,
    handle: AsyncHandle,
) -> Result<(String, String, String, String, String, bool, bool)> {
    match &eng.op(handle)?.kind {
        OpKind::Install {
            pckg_src,
            pckg_dest,
            inst_exe,
            inst_src,
            inst_dest,
            inst_remove,
            pckg_remove,
        } => Ok((
            pckg_src.clone(),
            pckg_dest.clone(),
            inst_exe.clone(),
            inst_src.clone(),
            inst_dest.clone(),
            *inst_remove,
            *pckg_remove,
        )),
        _ => Err(Error::BadAsyncOp),
    }
}

/// Replace the drive letter of a rooted path.
fn with_drive(path: &str, drive: char) -> String {
    let mut chars: Vec<char> = path.chars().collect();
    if chars.len() > 1 {
        chars[1] = drive;
    }
    chars.into_iter().collect()
}

pub(super) fn install_stage(
    eng: &mut Engine,
    handle: AsyncHandle,
    err: Option<Error>,
    stage: Stage,
) -> Result<()> {
    let (pckg_src, pckg_dest, inst_exe, inst_src, inst_dest, inst_remove, pckg_remove) =
        install_params(eng, handle)?;

    match stage {
        Stage::Initialise => {
            if let Some(err) = err {
                return Err(err);
            }
            {
                let op = eng.op_mut(handle)?;
                op.index = 0;
                op.recurse = true;
                op.status = Status::Delegate;
            }
            // Look for the installer on any drive.
            eng.new_op(
                Some(handle),
                OpKind::Find {
                    path: with_drive(&inst_exe, CHAR_DRIVE_ALL),
                    drive: CHAR_DRIVE_ALL,
                },
            )?;
            eng.mark(handle, 0, 100, 5)
        }

        Stage::Process => {
            if let Some(err) = err {
                return Err(err);
            }
            eng.op_mut(handle)?.index += 1;
            match eng.op(handle)?.index {
                1 => {
                    // Where did the search land?
                    let child = eng.op(handle)?.child.ok_or(Error::BadAsyncState)?;
                    let found = match &eng.op(child)?.kind {
                        OpKind::Find { drive, .. } => *drive,
                        _ => return Err(Error::BadAsyncState),
                    };
                    if found == CHAR_DRIVE_ALL {
                        // Not present anywhere: install the installer
                        // itself first.
                        eng.op_mut(handle)?.status = Status::Delegate;
                        eng.new_op(
                            Some(handle),
                            OpKind::WriteStart {
                                src: inst_src,
                                dest: inst_dest,
                                exe: String::new(),
                                remove: inst_remove,
                            },
                        )?;
                        eng.mark(handle, 5, 95, 25)
                    } else {
                        // Remember where the installer lives; the next
                        // pass starts the package install immediately.
                        let located = with_drive(&inst_exe, found);
                        if let OpKind::Install { inst_exe, .. } =
                            &mut eng.op_mut(handle)?.kind
                        {
                            *inst_exe = located;
                        }
                        Ok(())
                    }
                }
                2 => {
                    let exe = match &eng.op(handle)?.kind {
                        OpKind::Install { inst_exe, .. } => inst_exe.clone(),
                        _ => return Err(Error::BadAsyncState),
                    };
                    eng.op_mut(handle)?.status = Status::Delegate;
                    eng.new_op(
                        Some(handle),
                        OpKind::WriteStart {
                            src: pckg_src,
                            dest: pckg_dest,
                            exe,
                            remove: pckg_remove,
                        },
                    )?;
                    eng.mark(handle, 30, 70, 70)
                }
                _ => {
                    eng.op_mut(handle)?.status = Status::Success;
                    Ok(())
                }
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

fn find_params(eng: &Engine, handle: AsyncHandle) -> Result<String> {
    match &eng.op(handle)?.kind {
        OpKind::Find { path, .. } => Ok(path.clone()),
        _ => Err(Error::BadAsyncOp),
    }
}

pub(super) fn find_stage(
    eng: &mut Engine,
    handle: AsyncHandle,
    err: Option<Error>,
    stage: Stage,
) -> Result<()> {
    let path = find_params(eng, handle)?;

    match stage {
        Stage::Initialise => {
            if let Some(err) = err {
                return Err(err);
            }
            let chars: Vec<char> = path.chars().collect();
            let valid = chars.len() > 3
                && chars[0] == CHAR_DISC
                && ((DRIVE_FIRST..=DRIVE_LAST).contains(&chars[1])
                    || chars[1] == CHAR_DRIVE_ALL)
                && chars[2] == CHAR_SEPARATOR
                && chars[3] == CHAR_ROOT;
            if !valid {
                return Err(Error::BadName);
            }
            let (first, count) = if chars[1] == CHAR_DRIVE_ALL {
                // Loop through all possible drives.
                (DRIVE_FIRST, DRIVE_LAST as u32 - DRIVE_FIRST as u32 + 1)
            } else {
                (chars[1], 1)
            };
            {
                let op = eng.op_mut(handle)?;
                if let OpKind::Find { drive, .. } = &mut op.kind {
                    *drive = first;
                }
                op.index = 0;
                op.num = count;
                op.status = Status::Busy;
            }
            Ok(())
        }

        Stage::Process => {
            let found = err.is_none()
                && eng.op(handle)?.index != 0
                && match &eng.op(handle)?.cache_reply {
                    Some(CacheReply::Info { info }) => info.obj_type != ObjectType::NotFound,
                    _ => false,
                };
            if found {
                // The object exists on the drive just probed.
                eng.op_mut(handle)?.status = Status::Success;
                return Ok(());
            }
            match err {
                None | Some(Error::DriveEmpty) | Some(Error::NotFound) => {
                    let (index, num) = {
                        let op = eng.op(handle)?;
                        (op.index, op.num)
                    };
                    if index < num {
                        // Try the next drive letter.
                        let drive = {
                            let op = eng.op_mut(handle)?;
                            if let OpKind::Find { drive, .. } = &mut op.kind {
                                if index != 0 {
                                    *drive = (*drive as u8 + 1) as char;
                                }
                                *drive
                            } else {
                                return Err(Error::BadAsyncOp);
                            }
                        };
                        let probe = with_drive(&path, drive);
                        {
                            let op = eng.op_mut(handle)?;
                            op.status = Status::CatRead;
                            op.detail = tidy_args(&probe);
                        }
                        eng.cache_submit(handle, CacheCmd::Info { path: probe })?;
                        eng.mark(handle, index, num - index, 1)?;
                        eng.op_mut(handle)?.index += 1;
                        Ok(())
                    } else {
                        // Not found on any drive.
                        let op = eng.op_mut(handle)?;
                        if let OpKind::Find { drive, .. } = &mut op.kind {
                            *drive = CHAR_DRIVE_ALL;
                        }
                        op.status = Status::Success;
                        Ok(())
                    }
                }
                Some(err) => Err(err),
            }
        }

        Stage::Abort => match err {
            Some(err) => Err(err),
            None => {
                eng.op_mut(handle)?.status = Status::Aborted;
                Ok(())
            }
        },

        Stage::PreFinalise | Stage::PostFinalise => match err {
            Some(err) => Err(err),
            None => Ok(()),
        },
    }
}

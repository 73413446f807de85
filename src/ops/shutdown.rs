//! Task shutdown: enumerate the tasks with open files, record the ones
//! matching the caller's pattern in a log file, and stop each in turn.
//! The log is the input to a later restart operation.

use super::{AsyncHandle, Engine, OpKind, Stage, Status, MIN_TASKS};
use crate::err::{Error, Result};
use crate::unified::{UnifiedCmd, UnifiedCmdKind};
use crate::wildcard;

// Task list entries separate the name from the arguments with a space
// and terminate with a newline.
const TERM_NAME: char = ' ';
const TERM_ARGS: char = '\n';

fn params(eng: &Engine, handle: AsyncHandle) -> Result<(String, String, bool)> {
    match &eng.op(handle)?.kind {
        OpKind::Shutdown {
            path,
            pattern,
            append,
        } => Ok((path.clone(), pattern.clone(), *append)),
        _ => Err(Error::BadAsyncOp),
    }
}

pub(super) fn stage(
    eng: &mut Engine,
    handle: AsyncHandle,
    err: Option<Error>,
    stage: Stage,
) -> Result<()> {
    let (path, pattern, append) = params(eng, handle)?;

    match stage {
        Stage::Initialise => {
            {
                let op = eng.op_mut(handle)?;
                op.suspend = true;
                op.host = None;
            }
            if let Some(err) = err {
                return Err(err);
            }
            let log = eng.hostfs.open_log(&path, append)?;
            {
                let op = eng.op_mut(handle)?;
                op.host = Some(log);
                op.index = 0;
                op.status = Status::ProgList;
                op.tasks_size = MIN_TASKS;
            }
            eng.unified_submit(handle, UnifiedCmd::Tasks { size: MIN_TASKS })
        }

        Stage::Process => {
            if let Some(err) = err {
                // Try a larger buffer if the task list overflowed.
                if eng.op(handle)?.last_unified == Some(UnifiedCmdKind::Tasks)
                    && err == Error::TooManyTasks
                {
                    let size = {
                        let op = eng.op_mut(handle)?;
                        op.status = Status::ProgList;
                        op.tasks_size *= 2;
                        op.tasks_size
                    };
                    return eng.unified_submit(handle, UnifiedCmd::Tasks { size });
                }
                return Err(err);
            }

            if eng.op(handle)?.last_unified == Some(UnifiedCmdKind::Tasks) {
                let reply = eng.op_mut(handle)?.unified_reply.take();
                let tasks = match reply {
                    Some(crate::unified::UnifiedReply::Tasks { tasks }) => tasks,
                    _ => return Err(Error::BadParms),
                };
                let op = eng.op_mut(handle)?;
                op.index = 0;
                op.num = tasks.len() as u32;
                op.tasks = tasks;
            }

            // A command line just read either matches the pattern, in
            // which case the task is logged and stopped, or is skipped.
            let mut stopped = false;
            if eng.op(handle)?.last_unified == Some(UnifiedCmdKind::Detail) {
                let reply = eng.op_mut(handle)?.unified_reply.take();
                let detail = match reply {
                    Some(crate::unified::UnifiedReply::Detail { task }) => task,
                    _ => return Err(Error::BadParms),
                };
                if pattern.is_empty() || wildcard::matches(&pattern, &detail.args) {
                    let line = format!(
                        "{}{}{}{}",
                        detail.name, TERM_NAME, detail.args, TERM_ARGS
                    );
                    let log = eng.op(handle)?.host.ok_or(Error::BadParms)?;
                    eng.hostfs.write(log, line.as_bytes())?;

                    let (index, num, name) = {
                        let op = eng.op_mut(handle)?;
                        op.status = Status::ProgClose;
                        let name = op
                            .tasks
                            .get(op.index as usize)
                            .ok_or(Error::BadParms)?
                            .name
                            .clone();
                        (op.index, op.num, name)
                    };
                    eng.unified_submit(handle, UnifiedCmd::Stop { name })?;
                    eng.mark(handle, index * 5 + 1, (num - index) * 5 - 1, 4)?;
                    eng.op_mut(handle)?.index += 1;
                    stopped = true;
                } else {
                    eng.op_mut(handle)?.index += 1;
                }
            }

            if !stopped {
                let (index, num) = {
                    let op = eng.op(handle)?;
                    (op.index, op.num)
                };
                if index < num {
                    // Read the details of the next task.
                    let task = eng.op(handle)?.tasks[index as usize].clone();
                    eng.op_mut(handle)?.status = Status::ProgDetail;
                    eng.detail_app(handle, &task.name, &task.args)?;
                    eng.unified_submit(handle, UnifiedCmd::Detail { name: task.name })?;
                    eng.mark(handle, index * 5, (num - index) * 5, 1)?;
                } else {
                    eng.op_mut(handle)?.status = Status::Success;
                }
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
            if let Some(log) = eng.op_mut(handle)?.host.take() {
                let _ = eng.hostfs.close(log);
            }
            let abort = eng.op(handle)?.abort;
            if err.is_some() || abort {
                // Scrap the incomplete log.
                eng.hostfs.wipe(&path);
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

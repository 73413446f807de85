//! Task restart: replay a log file written by a shutdown operation,
//! starting each recorded task. A failed start raises a prompt; the
//! client may retry, skip, or silence further prompts.

use super::{AsyncHandle, Engine, OpKind, Response, Stage, Status};
use crate::err::{Error, Result};
use crate::unified::{StartAction, UnifiedCmd};
use memchr::memchr;

/// Split a task log into (name, arguments) pairs. A pair is complete
/// only when both terminators are present; a trailing fragment is
/// dropped, as is anything after the first malformed entry.
fn parse_log(bytes: &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let name_len = match memchr(b' ', &bytes[pos..]) {
            Some(len) => len,
            None => break,
        };
        let args_start = pos + name_len + 1;
        let args_len = match memchr(b'\n', &bytes[args_start..]) {
            Some(len) => len,
            None => break,
        };
        let name = String::from_utf8_lossy(&bytes[pos..pos + name_len]).into_owned();
        let args =
            String::from_utf8_lossy(&bytes[args_start..args_start + args_len]).into_owned();
        pairs.push((name, args));
        pos = args_start + args_len + 1;
    }
    pairs
}

fn params(eng: &Engine, handle: AsyncHandle) -> Result<(String, bool)> {
    match &eng.op(handle)?.kind {
        OpKind::Restart { path, remove } => Ok((path.clone(), *remove)),
        _ => Err(Error::BadAsyncOp),
    }
}

pub(super) fn stage(
    eng: &mut Engine,
    handle: AsyncHandle,
    err: Option<Error>,
    stage: Stage,
) -> Result<()> {
    let (path, remove) = params(eng, handle)?;

    match stage {
        Stage::Initialise => {
            eng.op_mut(handle)?.suspend = true;
            if let Some(err) = err {
                return Err(err);
            }
            let bytes = eng.hostfs.read_all(&path)?;
            let pairs = parse_log(&bytes);
            let op = eng.op_mut(handle)?;
            op.index = 0;
            op.num = pairs.len() as u32;
            op.cursor = 0;
            op.restart_list = pairs;
            op.status = Status::Busy;
            // Processing begins as if the previous task had been skipped.
            op.response = Response::Skip;
            Ok(())
        }

        Stage::Process => {
            if let Some(err) = err {
                // Query whether the start should be retried.
                let op = eng.op_mut(handle)?;
                op.status = Status::WaitRestart;
                op.wait_err = Some(err);
                return Ok(());
            }

            {
                let op = eng.op_mut(handle)?;
                if op.response == Response::Skip {
                    // Move on to the next recorded task.
                    if op.cursor >= op.restart_list.len() {
                        op.status = Status::Success;
                    } else {
                        op.current_task = op.restart_list[op.cursor].clone();
                        op.cursor += 1;
                    }
                } else {
                    // Try starting the same task again.
                    op.num += 1;
                    op.response = Response::Skip;
                }
            }

            if eng.op(handle)?.status != Status::Success {
                let (name, args, index, num) = {
                    let op = eng.op_mut(handle)?;
                    op.status = Status::ProgOpen;
                    (
                        op.current_task.0.clone(),
                        op.current_task.1.clone(),
                        op.index,
                        op.num,
                    )
                };
                eng.detail_app(handle, &name, &args)?;
                let action = if args.is_empty() {
                    StartAction::Default
                } else {
                    StartAction::Open
                };
                eng.unified_submit(handle, UnifiedCmd::Start { name, args, action })?;
                eng.mark(handle, index, num - index, 1)?;
                eng.op_mut(handle)?.index += 1;
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
            if remove {
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

#[cfg(test)]
mod tests {
    use super::parse_log;

    #[test]
    fn parses_name_and_argument_pairs() {
        let pairs = parse_log(b"APP1 \ndoc.odt\nAPP2 \n");
        // The second line has no space before its newline, so the name
        // spans into the following entry and only two pairs survive.
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], ("APP1".to_string(), "".to_string()));
    }

    #[test]
    fn parses_arguments() {
        let pairs = parse_log(b"Word :C.$.letter\nSheet \n");
        assert_eq!(
            pairs,
            vec![
                ("Word".to_string(), ":C.$.letter".to_string()),
                ("Sheet".to_string(), "".to_string()),
            ]
        );
    }

    #[test]
    fn truncated_logs_drop_the_fragment() {
        assert_eq!(parse_log(b"Word :C.$.letter"), vec![]);
        assert_eq!(parse_log(b""), vec![]);
    }
}

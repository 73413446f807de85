//! Completion of pending archive work. A copy or add scheduled on a tar
//! stream is driven in bounded slices, pausing briefly between slices so
//! the link stays responsive; the suboperation owns a clone of the
//! stream handle and closes it on the way out.

use super::{AsyncHandle, Engine, OpKind, Stage, Status, TAR_DELAY};
use crate::err::{Error, Result};

fn params(eng: &Engine, handle: AsyncHandle) -> Result<(crate::tar::TarHandle, Status, String)> {
    match &eng.op(handle)?.kind {
        OpKind::TarComplete {
            handle: tar,
            status,
            detail,
        } => Ok((*tar, *status, detail.clone())),
        _ => Err(Error::BadAsyncOp),
    }
}

pub(super) fn stage(
    eng: &mut Engine,
    handle: AsyncHandle,
    err: Option<Error>,
    stage: Stage,
) -> Result<()> {
    let (tar, display_status, detail) = params(eng, handle)?;

    match stage {
        Stage::Initialise => {
            if let Some(err) = err {
                return Err(err);
            }
            let cloned = eng.tar.clone_handle(tar)?;
            eng.op_mut(handle)?.dest_tar = Some(cloned);
            Ok(())
        }

        Stage::Process => {
            if let Some(err) = err {
                return Err(err);
            }
            let stream = eng.op(handle)?.dest_tar.ok_or(Error::BadAsyncState)?;
            let pos = eng.tar.continue_work(stream)?;
            if pos.remain != 0 {
                // Breathe between slices.
                {
                    let op = eng.op_mut(handle)?;
                    op.status = display_status;
                    op.detail = detail;
                }
                eng.timer_submit(handle, TAR_DELAY);
                eng.mark(handle, pos.done, pos.remain, pos.step)
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
            if let Some(stream) = eng.op_mut(handle)?.dest_tar.take() {
                let _ = eng.tar.close(stream);
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

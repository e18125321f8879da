//! Line-oriented operator console.

use std::io::{BufRead, Write};

use topo_common::error::{TopoError, TopoResult};
use topo_common::ids::{ConfigId, SessionId};
use topo_core::key::KeyType;
use topo_core::version::DatastoreVersion;
use topo_facade::protocol::Operation;
use topo_facade::request::{Request, RequestBody, ResponseBody, TcCall, TcResponse};
use tracing::debug;

use crate::app::CoordinatorApp;
use crate::itc;

/// Session the console acts under when it needs configuration mode.
pub const OPERATOR_SESSION: SessionId = u32::MAX;

const USAGE: &str = "commands: status | dirty | save | abort | clear-startup | quit";

/// Serves console commands from `input` until `quit` or end of input.
///
/// Returns the number of commands handled.
///
/// # Errors
///
/// Returns `TopoError::Io` when reading or writing the console fails, and coordinator errors that
/// are not carried in a result code.
pub fn run_console<R, W>(app: &CoordinatorApp, input: R, mut output: W) -> TopoResult<usize>
where
    R: BufRead,
    W: Write,
{
    let mut handled = 0_usize;
    for line in input.lines() {
        let line = line.map_err(io_error)?;
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if command == "quit" {
            break;
        }
        handled += 1;
        debug!(command, "console command");
        let answer = execute(app, command)?;
        writeln!(output, "{answer}").map_err(io_error)?;
    }
    output.flush().map_err(io_error)?;
    Ok(handled)
}

fn execute(app: &CoordinatorApp, command: &str) -> TopoResult<String> {
    match command {
        "status" => Ok(app.status()?.to_string()),
        "dirty" => dirty(app),
        "save" => tc(app, |session, config| TcCall::SaveConfiguration { session, config }),
        "abort" => tc(app, |session, config| TcCall::AbortCandidate { session, config }),
        "clear-startup" => tc(app, |session, config| TcCall::ClearStartup { session, config }),
        _ => Ok(USAGE.to_owned()),
    }
}

fn dirty(app: &CoordinatorApp) -> TopoResult<String> {
    let response = app.request(Request {
        header: itc::header(
            OPERATOR_SESSION,
            0,
            Operation::IsCandidateDirty,
            KeyType::Controller,
            DatastoreVersion::Candidate,
        ),
        body: RequestBody::Empty,
    })?;
    Ok(match response.body {
        ResponseBody::Dirty(dirty) => format!("dirty={dirty}"),
        _ => format!("error {:?}", response.result_code()),
    })
}

fn tc(app: &CoordinatorApp, call: impl FnOnce(SessionId, ConfigId) -> TcCall) -> TopoResult<String> {
    let config = app.facade.sessions.acquire(OPERATOR_SESSION)?;
    let response = app.tc(call(OPERATOR_SESSION, config));
    let _ = app.facade.sessions.release(OPERATOR_SESSION)?;
    Ok(describe(&response?))
}

fn describe(response: &TcResponse) -> String {
    if response.result.is_success() {
        format!("ok {:?}", response.reply)
    } else {
        format!("error {:?}", response.result)
    }
}

fn io_error(error: std::io::Error) -> TopoError {
    TopoError::Io(error.to_string())
}

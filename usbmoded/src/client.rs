// SPDX-License-Identifier: GPL-3.0-only

//! The `usbmoded client <subcommand>` CLI: one subcommand per RPC method in
//! `rpc.rs`, following the teacher's pattern of a thin per-command struct
//! feeding a single `subcommand_client` dispatcher.

use std::os::unix::net::UnixStream;

use anyhow::{bail, Context, Result};
use byteorder::{ReadBytesExt, WriteBytesExt};
use clap::{Parser, Subcommand};

use crate::{
    message::{self, FromSocket, ToSocket},
    rpc::{
        self, ClearUserConfigRequest, GetAvailableModesForUserRequest, GetAvailableModesRequest,
        GetConfigRequest, GetCurrentStateRequest, GetHiddenRequest, GetModesRequest,
        GetTargetConfigRequest, GetTargetStateRequest, GetWhitelistRequest, HideRequest,
        NetworkGetRequest, NetworkSetRequest, Request, RescueOffRequest, Response,
        SetConfigRequest, SetInWhitelistRequest, SetModeRequest, SetWhitelistRequest,
        UnhideRequest,
    },
};

fn negotiate_protocol(stream: &mut UnixStream) -> Result<()> {
    stream
        .write_u8(message::PROTOCOL_VERSION)
        .context("Failed to send protocol version")?;

    let ack = stream
        .read_u8()
        .context("Failed to receive protocol version acknowledgement")?;
    match ack {
        1 => {}
        0 => bail!(
            "Daemon does not support protocol version: {}",
            message::PROTOCOL_VERSION
        ),
        n => bail!("Invalid protocol version acknowledgement: {n}"),
    }

    Ok(())
}

fn call(stream: &mut UnixStream, request: Request) -> Result<Response> {
    request
        .to_socket(stream)
        .with_context(|| format!("Failed to send request: {request:?}"))?;

    Response::from_socket(stream).context("Failed to receive response")
}

macro_rules! expect_response {
    ($resp:expr, $variant:ident) => {
        match $resp {
            Response::Error(e) => bail!("{}", e.message),
            Response::$variant(inner) => inner,
            r => bail!("Unexpected response: {r:?}"),
        }
    };
}

pub fn subcommand_client(cli: &ClientCli) -> Result<()> {
    let mut stream =
        UnixStream::connect(rpc::SOCKET_PATH).context("Failed to connect to domain socket")?;
    negotiate_protocol(&mut stream)?;

    match &cli.command {
        ClientCommand::GetState(_) => {
            let resp = call(&mut stream, Request::GetTargetState(GetTargetStateRequest))?;
            let resp = expect_response!(resp, GetTargetState);
            println!("{}", resp.mode);
        }
        ClientCommand::GetCurrentState(_) => {
            let resp = call(&mut stream, Request::GetCurrentState(GetCurrentStateRequest))?;
            let resp = expect_response!(resp, GetCurrentState);
            println!("{}", resp.mode);
        }
        ClientCommand::GetTargetConfig(_) => {
            let resp = call(&mut stream, Request::GetTargetConfig(GetTargetConfigRequest))?;
            let resp = expect_response!(resp, GetTargetConfig);
            println!("network={} network_interface={}", resp.network, resp.network_interface);
        }
        ClientCommand::SetMode(c) => {
            let resp = call(
                &mut stream,
                Request::SetMode(SetModeRequest { mode: c.mode.clone() }),
            )?;
            expect_response!(resp, SetMode);
        }
        ClientCommand::GetConfig(c) => {
            let resp = call(
                &mut stream,
                Request::GetConfig(GetConfigRequest {
                    group: c.group.clone(),
                    key: c.key.clone(),
                }),
            )?;
            let resp = expect_response!(resp, GetConfig);
            println!("{}", resp.value);
        }
        ClientCommand::SetConfig(c) => {
            let resp = call(
                &mut stream,
                Request::SetConfig(SetConfigRequest {
                    group: c.group.clone(),
                    key: c.key.clone(),
                    value: c.value.clone(),
                }),
            )?;
            expect_response!(resp, SetConfig);
        }
        ClientCommand::Hide(c) => {
            let resp = call(&mut stream, Request::Hide(HideRequest { mode: c.mode.clone() }))?;
            expect_response!(resp, Hide);
        }
        ClientCommand::Unhide(c) => {
            let resp = call(&mut stream, Request::Unhide(UnhideRequest { mode: c.mode.clone() }))?;
            expect_response!(resp, Unhide);
        }
        ClientCommand::GetHidden(_) => {
            let resp = call(&mut stream, Request::GetHidden(GetHiddenRequest))?;
            let resp = expect_response!(resp, GetHidden);
            print_modes(&resp.modes);
        }
        ClientCommand::GetWhitelist(_) => {
            let resp = call(&mut stream, Request::GetWhitelist(GetWhitelistRequest))?;
            let resp = expect_response!(resp, GetWhitelist);
            print_modes(&resp.modes);
        }
        ClientCommand::SetWhitelist(c) => {
            let resp = call(
                &mut stream,
                Request::SetWhitelist(SetWhitelistRequest {
                    modes: c.modes.clone(),
                }),
            )?;
            expect_response!(resp, SetWhitelist);
        }
        ClientCommand::SetInWhitelist(c) => {
            let resp = call(
                &mut stream,
                Request::SetInWhitelist(SetInWhitelistRequest {
                    mode: c.mode.clone(),
                    allowed: !c.remove,
                }),
            )?;
            expect_response!(resp, SetInWhitelist);
        }
        ClientCommand::GetModes(_) => {
            let resp = call(&mut stream, Request::GetModes(GetModesRequest))?;
            let resp = expect_response!(resp, GetModes);
            print_modes(&resp.modes);
        }
        ClientCommand::GetAvailableModes(_) => {
            let resp = call(&mut stream, Request::GetAvailableModes(GetAvailableModesRequest))?;
            let resp = expect_response!(resp, GetAvailableModes);
            print_modes(&resp.modes);
        }
        ClientCommand::GetAvailableModesForUser(c) => {
            let resp = call(
                &mut stream,
                Request::GetAvailableModesForUser(GetAvailableModesForUserRequest { uid: c.uid }),
            )?;
            let resp = expect_response!(resp, GetAvailableModesForUser);
            print_modes(&resp.modes);
        }
        ClientCommand::NetworkSet(c) => {
            let resp = call(
                &mut stream,
                Request::NetworkSet(NetworkSetRequest {
                    key: c.key.clone(),
                    value: c.value.clone(),
                }),
            )?;
            expect_response!(resp, NetworkSet);
        }
        ClientCommand::NetworkGet(c) => {
            let resp = call(&mut stream, Request::NetworkGet(NetworkGetRequest { key: c.key.clone() }))?;
            let resp = expect_response!(resp, NetworkGet);
            println!("{}", resp.value);
        }
        ClientCommand::ClearUserConfig(_) => {
            let resp = call(&mut stream, Request::ClearUserConfig(ClearUserConfigRequest))?;
            expect_response!(resp, ClearUserConfig);
        }
        ClientCommand::RescueOff(_) => {
            let resp = call(&mut stream, Request::RescueOff(RescueOffRequest))?;
            expect_response!(resp, RescueOff);
        }
    }

    Ok(())
}

fn print_modes(modes: &[String]) {
    for mode in modes {
        println!("{mode}");
    }
}

/// Print the current target mode.
#[derive(Debug, Parser)]
struct GetStateCli;

/// Print the currently active mode, as opposed to the target being
/// transitioned to.
#[derive(Debug, Parser)]
struct GetCurrentStateCli;

/// Print the current target mode's network configuration.
#[derive(Debug, Parser)]
struct GetTargetConfigCli;

/// Request a mode switch.
#[derive(Debug, Parser)]
struct SetModeCli {
    mode: String,
}

/// Read one configuration key.
#[derive(Debug, Parser)]
struct GetConfigCli {
    group: String,
    key: String,
}

/// Write one configuration key.
#[derive(Debug, Parser)]
struct SetConfigCli {
    group: String,
    key: String,
    value: String,
}

/// Hide a mode from the mode list.
#[derive(Debug, Parser)]
struct HideCli {
    mode: String,
}

/// Unhide a previously hidden mode.
#[derive(Debug, Parser)]
struct UnhideCli {
    mode: String,
}

/// List hidden modes.
#[derive(Debug, Parser)]
struct GetHiddenCli;

/// List whitelisted modes.
#[derive(Debug, Parser)]
struct GetWhitelistCli;

/// Replace the whitelist.
#[derive(Debug, Parser)]
struct SetWhitelistCli {
    modes: Vec<String>,
}

/// Add or remove a single mode from the whitelist.
#[derive(Debug, Parser)]
struct SetInWhitelistCli {
    mode: String,

    /// Remove the mode instead of adding it.
    #[arg(long)]
    remove: bool,
}

/// List every installed mode.
#[derive(Debug, Parser)]
struct GetModesCli;

/// List modes available to the current user.
#[derive(Debug, Parser)]
struct GetAvailableModesCli;

/// List modes available to a specific user.
#[derive(Debug, Parser)]
struct GetAvailableModesForUserCli {
    uid: u32,
}

/// Set a network configuration key.
#[derive(Debug, Parser)]
struct NetworkSetCli {
    key: String,
    value: String,
}

/// Read a network configuration key.
#[derive(Debug, Parser)]
struct NetworkGetCli {
    key: String,
}

/// Clear per-user overrides for the current user.
#[derive(Debug, Parser)]
struct ClearUserConfigCli;

/// Leave rescue mode for the current session.
#[derive(Debug, Parser)]
struct RescueOffCli;

#[derive(Debug, Subcommand)]
enum ClientCommand {
    GetState(GetStateCli),
    GetCurrentState(GetCurrentStateCli),
    GetTargetConfig(GetTargetConfigCli),
    SetMode(SetModeCli),
    GetConfig(GetConfigCli),
    SetConfig(SetConfigCli),
    Hide(HideCli),
    Unhide(UnhideCli),
    GetHidden(GetHiddenCli),
    GetWhitelist(GetWhitelistCli),
    SetWhitelist(SetWhitelistCli),
    SetInWhitelist(SetInWhitelistCli),
    GetModes(GetModesCli),
    GetAvailableModes(GetAvailableModesCli),
    GetAvailableModesForUser(GetAvailableModesForUserCli),
    NetworkSet(NetworkSetCli),
    NetworkGet(NetworkGetCli),
    ClearUserConfig(ClearUserConfigCli),
    RescueOff(RescueOffCli),
}

/// Send messages to daemon.
#[derive(Debug, Parser)]
pub struct ClientCli {
    #[command(subcommand)]
    command: ClientCommand,
}

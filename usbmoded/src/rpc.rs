// SPDX-License-Identifier: GPL-3.0-only

//! The RPC surface (spec §4.I): a request/reply method table plus broadcast
//! signals, carried over the length-prefixed `UnixStream` framing in
//! `message.rs`. The spec describes this surface as carrier-agnostic; this
//! crate implements it as a small bespoke protocol (extending the teacher's
//! own socket framing) rather than pulling in a D-Bus stack, since nothing
//! in the example pack demonstrates real D-Bus usage to imitate.

use std::io;
use std::os::unix::net::UnixStream;

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::message::{
    read_string, read_string_list, write_string, write_string_list, FromSocket, MessageId, ToSocket,
};

pub const SOCKET_PATH: &str = "/run/usb-moded/socket";

macro_rules! unit_message {
    ($name:ident, $id:expr) => {
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl MessageId for $name {
            const ID: u8 = $id;
        }

        impl FromSocket for $name {
            fn from_socket(_stream: &mut UnixStream) -> io::Result<Self> {
                Ok(Self)
            }
        }

        impl ToSocket for $name {
            fn to_socket(&self, _stream: &mut UnixStream) -> io::Result<()> {
                Ok(())
            }
        }
    };
}

macro_rules! string_message {
    ($name:ident, $id:expr, $field:ident) => {
        #[derive(Debug, Clone, Default)]
        pub struct $name {
            pub $field: String,
        }

        impl MessageId for $name {
            const ID: u8 = $id;
        }

        impl FromSocket for $name {
            fn from_socket(stream: &mut UnixStream) -> io::Result<Self> {
                Ok(Self {
                    $field: read_string(stream)?,
                })
            }
        }

        impl ToSocket for $name {
            fn to_socket(&self, stream: &mut UnixStream) -> io::Result<()> {
                write_string(stream, &self.$field)
            }
        }
    };
}

macro_rules! string_list_message {
    ($name:ident, $id:expr, $field:ident) => {
        #[derive(Debug, Clone, Default)]
        pub struct $name {
            pub $field: Vec<String>,
        }

        impl MessageId for $name {
            const ID: u8 = $id;
        }

        impl FromSocket for $name {
            fn from_socket(stream: &mut UnixStream) -> io::Result<Self> {
                Ok(Self {
                    $field: read_string_list(stream)?,
                })
            }
        }

        impl ToSocket for $name {
            fn to_socket(&self, stream: &mut UnixStream) -> io::Result<()> {
                write_string_list(stream, &self.$field)
            }
        }
    };
}

// --- Requests ------------------------------------------------------------

unit_message!(GetTargetStateRequest, 1);
string_message!(GetTargetStateResponse, 2, mode);

unit_message!(GetTargetConfigRequest, 3);

#[derive(Debug, Clone, Default)]
pub struct GetTargetConfigResponse {
    pub network: bool,
    pub network_interface: String,
}

impl MessageId for GetTargetConfigResponse {
    const ID: u8 = 4;
}

impl FromSocket for GetTargetConfigResponse {
    fn from_socket(stream: &mut UnixStream) -> io::Result<Self> {
        let network = stream.read_u8()? != 0;
        let network_interface = read_string(stream)?;
        Ok(Self {
            network,
            network_interface,
        })
    }
}

impl ToSocket for GetTargetConfigResponse {
    fn to_socket(&self, stream: &mut UnixStream) -> io::Result<()> {
        stream.write_u8(self.network.into())?;
        write_string(stream, &self.network_interface)
    }
}

string_message!(SetModeRequest, 5, mode);
unit_message!(SetModeResponse, 6);

#[derive(Debug, Clone, Default)]
pub struct GetConfigRequest {
    pub group: String,
    pub key: String,
}

impl MessageId for GetConfigRequest {
    const ID: u8 = 7;
}

impl FromSocket for GetConfigRequest {
    fn from_socket(stream: &mut UnixStream) -> io::Result<Self> {
        Ok(Self {
            group: read_string(stream)?,
            key: read_string(stream)?,
        })
    }
}

impl ToSocket for GetConfigRequest {
    fn to_socket(&self, stream: &mut UnixStream) -> io::Result<()> {
        write_string(stream, &self.group)?;
        write_string(stream, &self.key)
    }
}

string_message!(GetConfigResponse, 8, value);

#[derive(Debug, Clone, Default)]
pub struct SetConfigRequest {
    pub group: String,
    pub key: String,
    pub value: String,
}

impl MessageId for SetConfigRequest {
    const ID: u8 = 9;
}

impl FromSocket for SetConfigRequest {
    fn from_socket(stream: &mut UnixStream) -> io::Result<Self> {
        Ok(Self {
            group: read_string(stream)?,
            key: read_string(stream)?,
            value: read_string(stream)?,
        })
    }
}

impl ToSocket for SetConfigRequest {
    fn to_socket(&self, stream: &mut UnixStream) -> io::Result<()> {
        write_string(stream, &self.group)?;
        write_string(stream, &self.key)?;
        write_string(stream, &self.value)
    }
}

unit_message!(SetConfigResponse, 10);

string_message!(HideRequest, 11, mode);
unit_message!(HideResponse, 12);
string_message!(UnhideRequest, 13, mode);
unit_message!(UnhideResponse, 14);
unit_message!(GetHiddenRequest, 15);
string_list_message!(GetHiddenResponse, 16, modes);

unit_message!(GetWhitelistRequest, 17);
string_list_message!(GetWhitelistResponse, 18, modes);
string_list_message!(SetWhitelistRequest, 19, modes);
unit_message!(SetWhitelistResponse, 20);

#[derive(Debug, Clone, Default)]
pub struct SetInWhitelistRequest {
    pub mode: String,
    pub allowed: bool,
}

impl MessageId for SetInWhitelistRequest {
    const ID: u8 = 21;
}

impl FromSocket for SetInWhitelistRequest {
    fn from_socket(stream: &mut UnixStream) -> io::Result<Self> {
        Ok(Self {
            mode: read_string(stream)?,
            allowed: stream.read_u8()? != 0,
        })
    }
}

impl ToSocket for SetInWhitelistRequest {
    fn to_socket(&self, stream: &mut UnixStream) -> io::Result<()> {
        write_string(stream, &self.mode)?;
        stream.write_u8(self.allowed.into())
    }
}

unit_message!(SetInWhitelistResponse, 22);

unit_message!(GetModesRequest, 23);
string_list_message!(GetModesResponse, 24, modes);

unit_message!(GetAvailableModesRequest, 25);
string_list_message!(GetAvailableModesResponse, 26, modes);

#[derive(Debug, Clone, Copy, Default)]
pub struct GetAvailableModesForUserRequest {
    pub uid: u32,
}

impl MessageId for GetAvailableModesForUserRequest {
    const ID: u8 = 27;
}

impl FromSocket for GetAvailableModesForUserRequest {
    fn from_socket(stream: &mut UnixStream) -> io::Result<Self> {
        Ok(Self {
            uid: stream.read_u32::<byteorder::LittleEndian>()?,
        })
    }
}

impl ToSocket for GetAvailableModesForUserRequest {
    fn to_socket(&self, stream: &mut UnixStream) -> io::Result<()> {
        stream.write_u32::<byteorder::LittleEndian>(self.uid)
    }
}

string_list_message!(GetAvailableModesForUserResponse, 28, modes);

#[derive(Debug, Clone, Default)]
pub struct NetworkSetRequest {
    pub key: String,
    pub value: String,
}

impl MessageId for NetworkSetRequest {
    const ID: u8 = 29;
}

impl FromSocket for NetworkSetRequest {
    fn from_socket(stream: &mut UnixStream) -> io::Result<Self> {
        Ok(Self {
            key: read_string(stream)?,
            value: read_string(stream)?,
        })
    }
}

impl ToSocket for NetworkSetRequest {
    fn to_socket(&self, stream: &mut UnixStream) -> io::Result<()> {
        write_string(stream, &self.key)?;
        write_string(stream, &self.value)
    }
}

unit_message!(NetworkSetResponse, 30);

string_message!(NetworkGetRequest, 31, key);
string_message!(NetworkGetResponse, 32, value);

unit_message!(ClearUserConfigRequest, 33);
unit_message!(ClearUserConfigResponse, 34);

unit_message!(RescueOffRequest, 35);
unit_message!(RescueOffResponse, 36);

/// Query the externally-visible *current* mode, distinct from
/// `GetTargetState`: while a transition is in flight the target can already
/// name the new mode while the current one is still `busy` (spec §4.I).
unit_message!(GetCurrentStateRequest, 37);
string_message!(GetCurrentStateResponse, 38, mode);

string_message!(ErrorResponse, 255, message);

#[derive(Debug)]
pub enum Request {
    GetTargetState(GetTargetStateRequest),
    GetTargetConfig(GetTargetConfigRequest),
    SetMode(SetModeRequest),
    GetConfig(GetConfigRequest),
    SetConfig(SetConfigRequest),
    Hide(HideRequest),
    Unhide(UnhideRequest),
    GetHidden(GetHiddenRequest),
    GetWhitelist(GetWhitelistRequest),
    SetWhitelist(SetWhitelistRequest),
    SetInWhitelist(SetInWhitelistRequest),
    GetModes(GetModesRequest),
    GetAvailableModes(GetAvailableModesRequest),
    GetAvailableModesForUser(GetAvailableModesForUserRequest),
    NetworkSet(NetworkSetRequest),
    NetworkGet(NetworkGetRequest),
    ClearUserConfig(ClearUserConfigRequest),
    RescueOff(RescueOffRequest),
    GetCurrentState(GetCurrentStateRequest),
}

macro_rules! dispatch_from_socket {
    ($stream:expr, $id:expr, $( $id_const:path => $ctor:path ),+ $(,)?) => {
        match $id {
            $( $id_const => { let inner = FromSocket::from_socket($stream)?; Ok($ctor(inner)) } )+
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid message ID: {other}"),
            )),
        }
    };
}

impl FromSocket for Request {
    fn from_socket(stream: &mut UnixStream) -> io::Result<Self> {
        let id = stream.read_u8()?;
        dispatch_from_socket!(stream, id,
            GetTargetStateRequest::ID => Self::GetTargetState,
            GetTargetConfigRequest::ID => Self::GetTargetConfig,
            SetModeRequest::ID => Self::SetMode,
            GetConfigRequest::ID => Self::GetConfig,
            SetConfigRequest::ID => Self::SetConfig,
            HideRequest::ID => Self::Hide,
            UnhideRequest::ID => Self::Unhide,
            GetHiddenRequest::ID => Self::GetHidden,
            GetWhitelistRequest::ID => Self::GetWhitelist,
            SetWhitelistRequest::ID => Self::SetWhitelist,
            SetInWhitelistRequest::ID => Self::SetInWhitelist,
            GetModesRequest::ID => Self::GetModes,
            GetAvailableModesRequest::ID => Self::GetAvailableModes,
            GetAvailableModesForUserRequest::ID => Self::GetAvailableModesForUser,
            NetworkSetRequest::ID => Self::NetworkSet,
            NetworkGetRequest::ID => Self::NetworkGet,
            ClearUserConfigRequest::ID => Self::ClearUserConfig,
            RescueOffRequest::ID => Self::RescueOff,
            GetCurrentStateRequest::ID => Self::GetCurrentState,
        )
    }
}

impl ToSocket for Request {
    fn to_socket(&self, stream: &mut UnixStream) -> io::Result<()> {
        macro_rules! write_variant {
            ($m:expr) => {{
                stream.write_u8($m.id())?;
                $m.to_socket(stream)
            }};
        }

        match self {
            Self::GetTargetState(m) => write_variant!(m),
            Self::GetTargetConfig(m) => write_variant!(m),
            Self::SetMode(m) => write_variant!(m),
            Self::GetConfig(m) => write_variant!(m),
            Self::SetConfig(m) => write_variant!(m),
            Self::Hide(m) => write_variant!(m),
            Self::Unhide(m) => write_variant!(m),
            Self::GetHidden(m) => write_variant!(m),
            Self::GetWhitelist(m) => write_variant!(m),
            Self::SetWhitelist(m) => write_variant!(m),
            Self::SetInWhitelist(m) => write_variant!(m),
            Self::GetModes(m) => write_variant!(m),
            Self::GetAvailableModes(m) => write_variant!(m),
            Self::GetAvailableModesForUser(m) => write_variant!(m),
            Self::NetworkSet(m) => write_variant!(m),
            Self::NetworkGet(m) => write_variant!(m),
            Self::ClearUserConfig(m) => write_variant!(m),
            Self::RescueOff(m) => write_variant!(m),
            Self::GetCurrentState(m) => write_variant!(m),
        }
    }
}

#[derive(Debug)]
pub enum Response {
    Error(ErrorResponse),
    GetTargetState(GetTargetStateResponse),
    GetTargetConfig(GetTargetConfigResponse),
    SetMode(SetModeResponse),
    GetConfig(GetConfigResponse),
    SetConfig(SetConfigResponse),
    Hide(HideResponse),
    Unhide(UnhideResponse),
    GetHidden(GetHiddenResponse),
    GetWhitelist(GetWhitelistResponse),
    SetWhitelist(SetWhitelistResponse),
    SetInWhitelist(SetInWhitelistResponse),
    GetModes(GetModesResponse),
    GetAvailableModes(GetAvailableModesResponse),
    GetAvailableModesForUser(GetAvailableModesForUserResponse),
    NetworkSet(NetworkSetResponse),
    NetworkGet(NetworkGetResponse),
    ClearUserConfig(ClearUserConfigResponse),
    RescueOff(RescueOffResponse),
    GetCurrentState(GetCurrentStateResponse),
}

impl FromSocket for Response {
    fn from_socket(stream: &mut UnixStream) -> io::Result<Self> {
        let id = stream.read_u8()?;
        dispatch_from_socket!(stream, id,
            ErrorResponse::ID => Self::Error,
            GetTargetStateResponse::ID => Self::GetTargetState,
            GetTargetConfigResponse::ID => Self::GetTargetConfig,
            SetModeResponse::ID => Self::SetMode,
            GetConfigResponse::ID => Self::GetConfig,
            SetConfigResponse::ID => Self::SetConfig,
            HideResponse::ID => Self::Hide,
            UnhideResponse::ID => Self::Unhide,
            GetHiddenResponse::ID => Self::GetHidden,
            GetWhitelistResponse::ID => Self::GetWhitelist,
            SetWhitelistResponse::ID => Self::SetWhitelist,
            SetInWhitelistResponse::ID => Self::SetInWhitelist,
            GetModesResponse::ID => Self::GetModes,
            GetAvailableModesResponse::ID => Self::GetAvailableModes,
            GetAvailableModesForUserResponse::ID => Self::GetAvailableModesForUser,
            NetworkSetResponse::ID => Self::NetworkSet,
            NetworkGetResponse::ID => Self::NetworkGet,
            ClearUserConfigResponse::ID => Self::ClearUserConfig,
            RescueOffResponse::ID => Self::RescueOff,
            GetCurrentStateResponse::ID => Self::GetCurrentState,
        )
    }
}

impl ToSocket for Response {
    fn to_socket(&self, stream: &mut UnixStream) -> io::Result<()> {
        macro_rules! write_variant {
            ($m:expr) => {{
                stream.write_u8($m.id())?;
                $m.to_socket(stream)
            }};
        }

        match self {
            Self::Error(m) => write_variant!(m),
            Self::GetTargetState(m) => write_variant!(m),
            Self::GetTargetConfig(m) => write_variant!(m),
            Self::SetMode(m) => write_variant!(m),
            Self::GetConfig(m) => write_variant!(m),
            Self::SetConfig(m) => write_variant!(m),
            Self::Hide(m) => write_variant!(m),
            Self::Unhide(m) => write_variant!(m),
            Self::GetHidden(m) => write_variant!(m),
            Self::GetWhitelist(m) => write_variant!(m),
            Self::SetWhitelist(m) => write_variant!(m),
            Self::SetInWhitelist(m) => write_variant!(m),
            Self::GetModes(m) => write_variant!(m),
            Self::GetAvailableModes(m) => write_variant!(m),
            Self::GetAvailableModesForUser(m) => write_variant!(m),
            Self::NetworkSet(m) => write_variant!(m),
            Self::NetworkGet(m) => write_variant!(m),
            Self::ClearUserConfig(m) => write_variant!(m),
            Self::RescueOff(m) => write_variant!(m),
            Self::GetCurrentState(m) => write_variant!(m),
        }
    }
}

// --- Broadcast signals -----------------------------------------------------

string_message!(CurrentStateSignal, 64, mode);
string_message!(TargetStateSignal, 65, mode);
string_message!(EventSignal, 66, name);
unit_message!(ConfigChangedSignal, 67);
string_list_message!(SupportedModesChangedSignal, 68, modes);
string_list_message!(AvailableModesChangedSignal, 69, modes);
string_list_message!(HiddenModesChangedSignal, 70, modes);
string_list_message!(WhitelistedModesChangedSignal, 71, modes);
string_message!(ErrorSignal, 72, message);

#[derive(Debug)]
pub enum Signal {
    CurrentState(CurrentStateSignal),
    TargetState(TargetStateSignal),
    Event(EventSignal),
    ConfigChanged(ConfigChangedSignal),
    SupportedModesChanged(SupportedModesChangedSignal),
    AvailableModesChanged(AvailableModesChangedSignal),
    HiddenModesChanged(HiddenModesChangedSignal),
    WhitelistedModesChanged(WhitelistedModesChangedSignal),
    Error(ErrorSignal),
}

impl FromSocket for Signal {
    fn from_socket(stream: &mut UnixStream) -> io::Result<Self> {
        let id = stream.read_u8()?;
        dispatch_from_socket!(stream, id,
            CurrentStateSignal::ID => Self::CurrentState,
            TargetStateSignal::ID => Self::TargetState,
            EventSignal::ID => Self::Event,
            ConfigChangedSignal::ID => Self::ConfigChanged,
            SupportedModesChangedSignal::ID => Self::SupportedModesChanged,
            AvailableModesChangedSignal::ID => Self::AvailableModesChanged,
            HiddenModesChangedSignal::ID => Self::HiddenModesChanged,
            WhitelistedModesChangedSignal::ID => Self::WhitelistedModesChanged,
            ErrorSignal::ID => Self::Error,
        )
    }
}

impl ToSocket for Signal {
    fn to_socket(&self, stream: &mut UnixStream) -> io::Result<()> {
        macro_rules! write_variant {
            ($m:expr) => {{
                stream.write_u8($m.id())?;
                $m.to_socket(stream)
            }};
        }

        match self {
            Self::CurrentState(m) => write_variant!(m),
            Self::TargetState(m) => write_variant!(m),
            Self::Event(m) => write_variant!(m),
            Self::ConfigChanged(m) => write_variant!(m),
            Self::SupportedModesChanged(m) => write_variant!(m),
            Self::AvailableModesChanged(m) => write_variant!(m),
            Self::HiddenModesChanged(m) => write_variant!(m),
            Self::WhitelistedModesChanged(m) => write_variant!(m),
            Self::Error(m) => write_variant!(m),
        }
    }
}

/// The method/signal name table, shared between RPC dispatch and the
/// `introspect-xml`/`busconfig-xml` CLI subcommands (spec §4.I
/// "Introspection"). Kept as plain data rather than derived from the enums
/// above so the XML output can include argument names without each message
/// type having to carry its own schema metadata.
pub struct MemberDescriptor {
    pub name: &'static str,
    pub in_args: &'static [&'static str],
    pub out_args: &'static [&'static str],
}

pub const METHODS: &[MemberDescriptor] = &[
    MemberDescriptor { name: "GetTargetState", in_args: &[], out_args: &["mode"] },
    MemberDescriptor { name: "GetTargetConfig", in_args: &[], out_args: &["network", "network_interface"] },
    MemberDescriptor { name: "SetMode", in_args: &["mode"], out_args: &[] },
    MemberDescriptor { name: "GetConfig", in_args: &["group", "key"], out_args: &["value"] },
    MemberDescriptor { name: "SetConfig", in_args: &["group", "key", "value"], out_args: &[] },
    MemberDescriptor { name: "Hide", in_args: &["mode"], out_args: &[] },
    MemberDescriptor { name: "Unhide", in_args: &["mode"], out_args: &[] },
    MemberDescriptor { name: "GetHidden", in_args: &[], out_args: &["modes"] },
    MemberDescriptor { name: "GetWhitelist", in_args: &[], out_args: &["modes"] },
    MemberDescriptor { name: "SetWhitelist", in_args: &["modes"], out_args: &[] },
    MemberDescriptor { name: "SetInWhitelist", in_args: &["mode", "allowed"], out_args: &[] },
    MemberDescriptor { name: "GetModes", in_args: &[], out_args: &["modes"] },
    MemberDescriptor { name: "GetAvailableModes", in_args: &[], out_args: &["modes"] },
    MemberDescriptor { name: "GetAvailableModesForUser", in_args: &["uid"], out_args: &["modes"] },
    MemberDescriptor { name: "NetworkSet", in_args: &["key", "value"], out_args: &[] },
    MemberDescriptor { name: "NetworkGet", in_args: &["key"], out_args: &["value"] },
    MemberDescriptor { name: "ClearUserConfig", in_args: &[], out_args: &[] },
    MemberDescriptor { name: "RescueOff", in_args: &[], out_args: &[] },
    MemberDescriptor { name: "GetCurrentState", in_args: &[], out_args: &["mode"] },
];

pub const SIGNALS: &[MemberDescriptor] = &[
    MemberDescriptor { name: "CurrentState", in_args: &[], out_args: &["mode"] },
    MemberDescriptor { name: "TargetState", in_args: &[], out_args: &["mode"] },
    MemberDescriptor { name: "Event", in_args: &[], out_args: &["name"] },
    MemberDescriptor { name: "ConfigChanged", in_args: &[], out_args: &[] },
    MemberDescriptor { name: "SupportedModesChanged", in_args: &[], out_args: &["modes"] },
    MemberDescriptor { name: "AvailableModesChanged", in_args: &[], out_args: &["modes"] },
    MemberDescriptor { name: "HiddenModesChanged", in_args: &[], out_args: &["modes"] },
    MemberDescriptor { name: "WhitelistedModesChanged", in_args: &[], out_args: &["modes"] },
];

/// A minimal, introspection-style XML document listing the method/signal
/// table above (spec §4.I `introspect-xml`). Not real D-Bus introspection
/// XML, since this isn't a real D-Bus service, but the same shape.
pub fn introspection_xml() -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<interface name=\"org.sailfishos.usbmoded\">\n");
    for m in METHODS {
        out.push_str(&format!("  <method name=\"{}\">\n", m.name));
        for arg in m.in_args {
            out.push_str(&format!("    <arg name=\"{arg}\" direction=\"in\"/>\n"));
        }
        for arg in m.out_args {
            out.push_str(&format!("    <arg name=\"{arg}\" direction=\"out\"/>\n"));
        }
        out.push_str("  </method>\n");
    }
    for s in SIGNALS {
        out.push_str(&format!("  <signal name=\"{}\">\n", s.name));
        for arg in s.out_args {
            out.push_str(&format!("    <arg name=\"{arg}\"/>\n"));
        }
        out.push_str("  </signal>\n");
    }
    out.push_str("</interface>\n");
    out
}

/// The policy-config XML fragment that would grant clients access to the
/// method table above (spec §4.I `busconfig-xml`).
pub fn busconfig_xml() -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<!DOCTYPE busconfig PUBLIC \"-//freedesktop//DTD D-BUS Bus Configuration 1.0//EN\"\n \"http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd\">\n<busconfig>\n  <policy user=\"root\">\n    <allow own=\"org.sailfishos.usbmoded\"/>\n  </policy>\n  <policy context=\"default\">\n");
    for m in METHODS {
        out.push_str(&format!(
            "    <allow send_destination=\"org.sailfishos.usbmoded\" send_member=\"{}\"/>\n",
            m.name
        ));
    }
    out.push_str("  </policy>\n</busconfig>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn set_mode_request_round_trips() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let req = Request::SetMode(SetModeRequest {
            mode: "mtp_mode".to_owned(),
        });
        req.to_socket(&mut a).unwrap();
        let decoded = Request::from_socket(&mut b).unwrap();
        match decoded {
            Request::SetMode(m) => assert_eq!(m.mode, "mtp_mode"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn get_whitelist_response_round_trips_empty_and_nonempty() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let resp = Response::GetWhitelist(GetWhitelistResponse {
            modes: vec!["mtp_mode".to_owned(), "rndis_mode".to_owned()],
        });
        resp.to_socket(&mut a).unwrap();
        let decoded = Response::from_socket(&mut b).unwrap();
        match decoded {
            Response::GetWhitelist(m) => assert_eq!(m.modes, vec!["mtp_mode", "rndis_mode"]),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn signal_round_trips() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let sig = Signal::TargetState(TargetStateSignal {
            mode: "charging_only".to_owned(),
        });
        sig.to_socket(&mut a).unwrap();
        let decoded = Signal::from_socket(&mut b).unwrap();
        match decoded {
            Signal::TargetState(m) => assert_eq!(m.mode, "charging_only"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn introspection_xml_lists_every_method() {
        let xml = introspection_xml();
        for m in METHODS {
            assert!(xml.contains(m.name), "missing method {}", m.name);
        }
    }
}

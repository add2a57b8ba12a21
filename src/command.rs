//! Engine commands and their wire format
//!
//! # Layout (little-endian)
//!
//! ```text
//! header   u32 version | u32 count
//! command  u32 tag | u32 n_num | n_num x f32 | u32 n_str | n_str x (u32 len | utf-8 bytes)
//! ```
//!
//! The layout is append-only: the engine reads the tag, then the parameters
//! it already expects for that tag. Tags form a closed set versioned by
//! [`WIRE_VERSION`]; an engine that sees a tag it does not know must treat it
//! as a fatal mismatch.

use crate::error::{LockstepError, Result};

/// Version written in every command buffer header
pub const WIRE_VERSION: u32 = 1;

/// Bytes taken by the buffer header
pub const HEADER_LEN: usize = 8;

/// Wire tag of each command variant
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandTag {
    SpawnAgent = 1,
    TeleportCamera = 2,
    RenderViewport = 3,
    RenderQuality = 4,
    Custom = 5,
}

impl TryFrom<u32> for CommandTag {
    type Error = LockstepError;

    fn try_from(v: u32) -> Result<Self> {
        Ok(match v {
            1 => CommandTag::SpawnAgent,
            2 => CommandTag::TeleportCamera,
            3 => CommandTag::RenderViewport,
            4 => CommandTag::RenderQuality,
            5 => CommandTag::Custom,
            other => return Err(LockstepError::UnknownCommandTag(other)),
        })
    }
}

/// A command as it travels on the wire: a tag plus its parameter lists
#[derive(Debug, Clone, PartialEq)]
pub struct RawCommand {
    pub tag: u32,
    pub num_params: Vec<f32>,
    pub string_params: Vec<String>,
}

impl RawCommand {
    /// Exact number of bytes [`write_to`](Self::write_to) produces
    pub fn encoded_len(&self) -> usize {
        12 + 4 * self.num_params.len()
            + self
                .string_params
                .iter()
                .map(|s| 4 + s.len())
                .sum::<usize>()
    }

    fn write_to(&self, w: &mut Writer<'_>) {
        w.put_u32(self.tag);
        w.put_u32(self.num_params.len() as u32);
        for &n in &self.num_params {
            w.put_f32(n);
        }
        w.put_u32(self.string_params.len() as u32);
        for s in &self.string_params {
            w.put_u32(s.len() as u32);
            w.put_bytes(s.as_bytes());
        }
    }

    fn read_from(r: &mut Reader<'_>) -> Result<Self> {
        let tag = r.u32()?;
        let n_num = r.u32()? as usize;
        let mut num_params = Vec::with_capacity(n_num.min(r.remaining() / 4));
        for _ in 0..n_num {
            num_params.push(r.f32()?);
        }
        let n_str = r.u32()? as usize;
        let mut string_params = Vec::with_capacity(n_str.min(r.remaining() / 4));
        for _ in 0..n_str {
            let len = r.u32()? as usize;
            let bytes = r.bytes(len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| LockstepError::MalformedCommandBuffer("string parameter is not utf-8"))?;
            string_params.push(s.to_string());
        }
        Ok(Self {
            tag,
            num_params,
            string_params,
        })
    }
}

/// Commands understood by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Spawn an agent at a location
    SpawnAgent {
        agent_type: String,
        name: String,
        location: [f32; 3],
        rotation: [f32; 3],
        max_height: f32,
        is_main_agent: bool,
    },
    /// Move the viewport camera
    TeleportCamera {
        location: [f32; 3],
        rotation: [f32; 3],
    },
    /// Turn viewport rendering on or off
    RenderViewport { enabled: bool },
    /// 0 = low .. 3 = epic
    RenderQuality { level: u8 },
    /// Arbitrary world command; only meaningful to worlds that define it
    Custom {
        name: String,
        num_params: Vec<f32>,
        string_params: Vec<String>,
    },
}

impl Command {
    /// Spawn a non-main agent with no height limit
    pub fn spawn_agent(
        agent_type: &str,
        name: &str,
        location: [f32; 3],
        rotation: [f32; 3],
    ) -> Self {
        Command::SpawnAgent {
            agent_type: agent_type.to_string(),
            name: name.to_string(),
            location,
            rotation,
            max_height: f32::MAX,
            is_main_agent: false,
        }
    }

    /// A world command with the given parameters
    pub fn world(name: &str, num_params: Vec<f32>, string_params: Vec<String>) -> Self {
        Command::Custom {
            name: name.to_string(),
            num_params,
            string_params,
        }
    }

    /// Spawn a static or simulated prop. Props do not survive a reset.
    pub fn spawn_prop(
        prop_type: &str,
        location: [f32; 3],
        rotation: [f32; 3],
        scale: f32,
        sim_physics: bool,
        material: &str,
        tag: &str,
    ) -> Self {
        let mut nums = Vec::with_capacity(8);
        nums.extend_from_slice(&location);
        nums.extend_from_slice(&rotation);
        nums.push(scale);
        nums.push(sim_physics as u8 as f32);
        Command::world(
            "SpawnProp",
            nums,
            vec![prop_type.to_string(), material.to_string(), tag.to_string()],
        )
    }

    pub fn tag(&self) -> CommandTag {
        match self {
            Command::SpawnAgent { .. } => CommandTag::SpawnAgent,
            Command::TeleportCamera { .. } => CommandTag::TeleportCamera,
            Command::RenderViewport { .. } => CommandTag::RenderViewport,
            Command::RenderQuality { .. } => CommandTag::RenderQuality,
            Command::Custom { .. } => CommandTag::Custom,
        }
    }

    /// Lower to the wire representation
    pub fn to_raw(&self) -> RawCommand {
        let (num_params, string_params) = match self {
            Command::SpawnAgent {
                agent_type,
                name,
                location,
                rotation,
                max_height,
                is_main_agent,
            } => {
                let mut nums = Vec::with_capacity(8);
                nums.extend_from_slice(location);
                nums.extend_from_slice(rotation);
                nums.push(*max_height);
                nums.push(*is_main_agent as u8 as f32);
                (nums, vec![name.clone(), agent_type.clone()])
            }
            Command::TeleportCamera { location, rotation } => {
                let mut nums = Vec::with_capacity(6);
                nums.extend_from_slice(location);
                nums.extend_from_slice(rotation);
                (nums, Vec::new())
            }
            Command::RenderViewport { enabled } => (vec![*enabled as u8 as f32], Vec::new()),
            Command::RenderQuality { level } => (vec![*level as f32], Vec::new()),
            Command::Custom {
                name,
                num_params,
                string_params,
            } => {
                let mut strings = Vec::with_capacity(string_params.len() + 1);
                strings.push(name.clone());
                strings.extend(string_params.iter().cloned());
                (num_params.clone(), strings)
            }
        };
        RawCommand {
            tag: self.tag() as u32,
            num_params,
            string_params,
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.to_raw().encoded_len()
    }
}

impl TryFrom<RawCommand> for Command {
    type Error = LockstepError;

    fn try_from(raw: RawCommand) -> Result<Self> {
        let tag = CommandTag::try_from(raw.tag)?;
        let n = &raw.num_params;
        let expect = |nums: usize, strs: usize| -> Result<()> {
            if raw.num_params.len() != nums || raw.string_params.len() != strs {
                return Err(LockstepError::MalformedCommandBuffer(
                    "unexpected parameter count for tag",
                ));
            }
            Ok(())
        };

        Ok(match tag {
            CommandTag::SpawnAgent => {
                expect(8, 2)?;
                let mut strings = raw.string_params.into_iter();
                let name = strings.next().unwrap_or_default();
                let agent_type = strings.next().unwrap_or_default();
                Command::SpawnAgent {
                    agent_type,
                    name,
                    location: [n[0], n[1], n[2]],
                    rotation: [n[3], n[4], n[5]],
                    max_height: n[6],
                    is_main_agent: n[7] != 0.0,
                }
            }
            CommandTag::TeleportCamera => {
                expect(6, 0)?;
                Command::TeleportCamera {
                    location: [n[0], n[1], n[2]],
                    rotation: [n[3], n[4], n[5]],
                }
            }
            CommandTag::RenderViewport => {
                expect(1, 0)?;
                Command::RenderViewport { enabled: n[0] != 0.0 }
            }
            CommandTag::RenderQuality => {
                expect(1, 0)?;
                Command::RenderQuality { level: n[0] as u8 }
            }
            CommandTag::Custom => {
                if raw.string_params.is_empty() {
                    return Err(LockstepError::MalformedCommandBuffer(
                        "world command without a name",
                    ));
                }
                let mut strings = raw.string_params.into_iter();
                let name = strings.next().unwrap_or_default();
                Command::Custom {
                    name,
                    num_params: raw.num_params,
                    string_params: strings.collect(),
                }
            }
        })
    }
}

impl From<Command> for RawCommand {
    fn from(cmd: Command) -> Self {
        cmd.to_raw()
    }
}

impl From<&Command> for RawCommand {
    fn from(cmd: &Command) -> Self {
        cmd.to_raw()
    }
}

/// Total encoded size of `commands`, header included
pub fn encoded_len(commands: &[RawCommand]) -> usize {
    HEADER_LEN + commands.iter().map(RawCommand::encoded_len).sum::<usize>()
}

/// Encode `commands` into the front of `out`.
///
/// All or nothing: if the encoding does not fit, `out` is left untouched and
/// `CommandOverflow` is returned.
pub fn encode_into(commands: &[RawCommand], out: &mut [u8]) -> Result<usize> {
    let required = encoded_len(commands);
    if required > out.len() {
        return Err(LockstepError::CommandOverflow {
            capacity: out.len(),
            required,
        });
    }
    let mut w = Writer { buf: out, pos: 0 };
    w.put_u32(WIRE_VERSION);
    w.put_u32(commands.len() as u32);
    for cmd in commands {
        cmd.write_to(&mut w);
    }
    debug_assert_eq!(w.pos, required);
    Ok(required)
}

/// Decode a command buffer into raw commands, in order
pub fn decode(buf: &[u8]) -> Result<Vec<RawCommand>> {
    let mut r = Reader { buf, pos: 0 };
    let version = r.u32()?;
    if version != WIRE_VERSION {
        return Err(LockstepError::MalformedCommandBuffer("unsupported wire version"));
    }
    let count = r.u32()? as usize;
    let mut out = Vec::with_capacity(count.min(r.remaining() / 12));
    for _ in 0..count {
        out.push(RawCommand::read_from(&mut r)?);
    }
    Ok(out)
}

/// Decode a command buffer into typed commands, failing on unknown tags
pub fn decode_commands(buf: &[u8]) -> Result<Vec<Command>> {
    decode(buf)?.into_iter().map(Command::try_from).collect()
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    #[inline]
    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    #[inline]
    fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_le_bytes());
    }

    #[inline]
    fn put_f32(&mut self, v: f32) {
        self.put_bytes(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(LockstepError::MalformedCommandBuffer("truncated command buffer"));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Vec<Command> {
        vec![
            Command::spawn_agent("UavAgent", "uav0", [0.0, 0.0, 5.0], [0.0, 0.0, 90.0]),
            Command::TeleportCamera {
                location: [1.0, 2.0, 3.0],
                rotation: [0.0, -15.0, 0.0],
            },
            Command::RenderViewport { enabled: false },
            Command::RenderQuality { level: 3 },
            Command::world("OpenDoor", vec![1.0], vec!["front".into(), "fast".into()]),
        ]
    }

    #[test]
    fn test_layout_of_single_command() {
        let raw = Command::RenderQuality { level: 2 }.to_raw();
        let mut buf = [0u8; 64];
        let n = encode_into(&[raw], &mut buf).unwrap();
        assert_eq!(n, HEADER_LEN + 16);
        assert_eq!(&buf[0..4], &WIRE_VERSION.to_le_bytes());
        assert_eq!(&buf[4..8], &1u32.to_le_bytes());
        assert_eq!(&buf[8..12], &(CommandTag::RenderQuality as u32).to_le_bytes());
        assert_eq!(&buf[12..16], &1u32.to_le_bytes());
        assert_eq!(&buf[16..20], &2.0f32.to_le_bytes());
        assert_eq!(&buf[20..24], &0u32.to_le_bytes());
    }

    #[test]
    fn test_sequence_survives_in_order() {
        let cmds = sample();
        let raws: Vec<_> = cmds.iter().map(Command::to_raw).collect();
        let mut buf = vec![0u8; encoded_len(&raws)];
        encode_into(&raws, &mut buf).unwrap();
        assert_eq!(decode_commands(&buf).unwrap(), cmds);
    }

    #[test]
    fn test_overflow_leaves_output_untouched() {
        let raws: Vec<_> = sample().iter().map(Command::to_raw).collect();
        let mut buf = vec![0xAAu8; encoded_len(&raws) - 1];
        let err = encode_into(&raws, &mut buf).unwrap_err();
        assert!(matches!(err, LockstepError::CommandOverflow { .. }));
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        let raw = RawCommand {
            tag: 99,
            num_params: vec![],
            string_params: vec![],
        };
        let mut buf = [0u8; 32];
        encode_into(&[raw], &mut buf).unwrap();
        assert!(matches!(
            decode_commands(&buf),
            Err(LockstepError::UnknownCommandTag(99))
        ));
    }

    #[test]
    fn test_truncated_and_bad_version() {
        let raws = vec![Command::RenderViewport { enabled: true }.to_raw()];
        let mut buf = vec![0u8; encoded_len(&raws)];
        encode_into(&raws, &mut buf).unwrap();
        assert!(decode(&buf[..buf.len() - 2]).is_err());

        buf[0] = 7;
        assert!(matches!(
            decode(&buf),
            Err(LockstepError::MalformedCommandBuffer("unsupported wire version"))
        ));
    }

    #[test]
    fn test_spawn_prop_is_world_command() {
        let cmd = Command::spawn_prop("box", [1.0, 2.0, 3.0], [0.0; 3], 2.0, true, "gold", "t");
        let raw = cmd.to_raw();
        assert_eq!(raw.tag, CommandTag::Custom as u32);
        assert_eq!(raw.string_params[0], "SpawnProp");
        assert_eq!(raw.num_params.len(), 8);
        assert_eq!(raw.num_params[7], 1.0);
    }

    fn arb_vec3() -> impl Strategy<Value = [f32; 3]> {
        prop::array::uniform3(-1.0e6f32..1.0e6)
    }

    fn arb_command() -> impl Strategy<Value = Command> {
        prop_oneof![
            ("[A-Za-z]{1,12}", "[a-z0-9_]{1,12}", arb_vec3(), arb_vec3(), any::<bool>()).prop_map(
                |(agent_type, name, location, rotation, is_main_agent)| Command::SpawnAgent {
                    agent_type,
                    name,
                    location,
                    rotation,
                    max_height: 100.0,
                    is_main_agent,
                }
            ),
            (arb_vec3(), arb_vec3())
                .prop_map(|(location, rotation)| Command::TeleportCamera { location, rotation }),
            any::<bool>().prop_map(|enabled| Command::RenderViewport { enabled }),
            (0u8..4).prop_map(|level| Command::RenderQuality { level }),
            (
                "\\PC{1,16}",
                prop::collection::vec(-1.0e6f32..1.0e6, 0..6),
                prop::collection::vec("\\PC{0,16}", 0..4)
            )
                .prop_map(|(name, num_params, string_params)| Command::Custom {
                    name,
                    num_params,
                    string_params,
                }),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_reproduces_enqueued_sequence(cmds in prop::collection::vec(arb_command(), 0..12)) {
            let raws: Vec<_> = cmds.iter().map(Command::to_raw).collect();
            let mut buf = vec![0u8; encoded_len(&raws)];
            let written = encode_into(&raws, &mut buf).unwrap();
            prop_assert_eq!(written, buf.len());
            prop_assert_eq!(decode_commands(&buf).unwrap(), cmds);
        }
    }
}

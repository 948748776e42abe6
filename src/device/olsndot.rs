// Olsndot LED driver bus access.
//
// The driver sits on a shared RS485-style serial bus and is addressed by a
// 32 bit MAC. Every frame is: magic byte, body length, command byte, MAC
// (little endian), payload, XOR checksum over the body. The device answers
// IDENT with its channel/resolution metadata and acknowledges FRAMEBUF
// writes; frames carrying a foreign MAC are ignored.

use super::PwmDriver;
use anyhow::{bail, ensure, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::io;
use tokio::time::{timeout, Duration};
use tokio_serial::SerialStream;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, info};

const BAUD: u32 = 1_000_000;
const MAGIC: u8 = 0x55;
const CMD_IDENT: u8 = 0x00;
const CMD_FRAMEBUF: u8 = 0x01;
const ACK: u8 = 0x06;
// cmd + mac, present in every frame body
const HEADER_LEN: usize = 5;
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, PartialEq)]
pub(crate) struct Frame {
    pub cmd: u8,
    pub mac: u32,
    pub payload: Bytes,
}

pub(crate) struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body_len = HEADER_LEN + frame.payload.len();
        if body_len > u8::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame payload too long",
            ));
        }
        dst.reserve(body_len + 3);
        dst.put_u8(MAGIC);
        dst.put_u8(body_len as u8);
        let body_start = dst.len();
        dst.put_u8(frame.cmd);
        dst.put_u32_le(frame.mac);
        dst.extend_from_slice(&frame.payload);
        let checksum = dst[body_start..].iter().fold(0u8, |acc, b| acc ^ b);
        dst.put_u8(checksum);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            // resynchronize on the magic byte, the bus idles noisy
            match src.iter().position(|&b| b == MAGIC) {
                Some(0) => {}
                Some(skip) => src.advance(skip),
                None => {
                    src.clear();
                    return Ok(None);
                }
            }
            if src.len() < 2 {
                return Ok(None);
            }
            let body_len = src[1] as usize;
            if body_len < HEADER_LEN {
                // not a frame start, skip this magic byte and rescan
                src.advance(1);
                continue;
            }
            if src.len() < body_len + 3 {
                return Ok(None);
            }
            let expected = src[2 + body_len];
            let actual = src[2..2 + body_len].iter().fold(0u8, |acc, &b| acc ^ b);
            if actual != expected {
                src.advance(1);
                continue;
            }
            src.advance(2);
            let mut body = src.split_to(body_len);
            src.advance(1); // checksum
            let cmd = body.get_u8();
            let mac = body.get_u32_le();
            return Ok(Some(Frame {
                cmd,
                mac,
                payload: body.freeze(),
            }));
        }
    }
}

type FrameLink = Framed<SerialStream, FrameCodec>;

pub struct Olsndot {
    link: FrameLink,
    mac: u32,
    nchannels: usize,
    nbits: u8,
    firmware: (u8, u8),
}

impl Olsndot {
    /// Opens the bus and identifies the device behind `mac`.
    pub async fn open(path: &str, mac: u32) -> Result<Self> {
        let port = super::open_port(path, BAUD)
            .with_context(|| format!("opening driver port {path}"))?;
        let mut link = FrameCodec.framed(port);
        link.send(Frame {
            cmd: CMD_IDENT,
            mac,
            payload: Bytes::new(),
        })
        .await
        .context("sending ident request")?;
        let reply = Self::response(&mut link, mac)
            .await
            .with_context(|| format!("identifying driver {mac:08x}"))?;
        ensure!(
            reply.cmd == CMD_IDENT,
            "unexpected reply {:#04x} to ident",
            reply.cmd
        );
        ensure!(reply.payload.len() == 4, "short ident payload");
        let mut payload = reply.payload;
        let nchannels = payload.get_u8() as usize;
        let nbits = payload.get_u8();
        let firmware = (payload.get_u8(), payload.get_u8());
        ensure!(nchannels > 0, "driver reports no channels");
        // setpoints travel as left-aligned u16 words
        ensure!(
            (1..=16).contains(&nbits),
            "unsupported PWM resolution of {nbits} bits"
        );
        info!("identified driver {mac:08x}, {nchannels} channels at {nbits} bits");
        Ok(Self {
            link,
            mac,
            nchannels,
            nbits,
            firmware,
        })
    }

    pub fn mac(&self) -> u32 {
        self.mac
    }

    /// Writes all channel duty-cycle registers in one frame and awaits the ack.
    pub async fn send_framebuf(&mut self, values: &[u16]) -> Result<()> {
        ensure!(
            values.len() == self.nchannels,
            "frame buffer holds {} values but the driver has {} channels",
            values.len(),
            self.nchannels
        );
        let mut payload = BytesMut::with_capacity(values.len() * 2);
        for &value in values {
            payload.put_u16_le(value);
        }
        self.link
            .send(Frame {
                cmd: CMD_FRAMEBUF,
                mac: self.mac,
                payload: payload.freeze(),
            })
            .await
            .context("sending frame buffer")?;
        let reply = Self::response(&mut self.link, self.mac)
            .await
            .context("waiting for frame buffer ack")?;
        ensure!(
            reply.cmd == CMD_FRAMEBUF && reply.payload.first() == Some(&ACK),
            "driver rejected the frame buffer"
        );
        Ok(())
    }

    async fn response(link: &mut FrameLink, mac: u32) -> Result<Frame> {
        let next_own_frame = async {
            while let Some(item) = link.next().await {
                let frame = item?;
                if frame.mac == mac {
                    return Ok(frame);
                }
                debug!("skipping frame addressed to {:08x}", frame.mac);
            }
            bail!("serial stream closed")
        };
        match timeout(RESPONSE_TIMEOUT, next_own_frame).await {
            Ok(result) => result,
            Err(_) => bail!("no answer within {RESPONSE_TIMEOUT:?}"),
        }
    }
}

impl PwmDriver for Olsndot {
    fn channel_count(&self) -> usize {
        self.nchannels
    }

    fn native_resolution(&self) -> u8 {
        self.nbits
    }

    async fn set_channel_values(&mut self, values: &[u16]) -> Result<()> {
        self.send_framebuf(values).await
    }
}

impl fmt::Display for Olsndot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "olsndot {:08x} ({} channels, {} bit, firmware {}.{})",
            self.mac, self.nchannels, self.nbits, self.firmware.0, self.firmware.1
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn decoder_resyncs_past_bus_noise() {
        let mut buf = BytesMut::from(&[0x00, 0x13, 0x47][..]); // line noise before the frame
        buf.extend_from_slice(&encoded(Frame {
            cmd: CMD_IDENT,
            mac: 0xDEBE10BB,
            payload: Bytes::from_static(&[16, 11, 1, 2]),
        }));
        let frame = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.cmd, CMD_IDENT);
        assert_eq!(frame.mac, 0xDEBE10BB);
        assert_eq!(frame.payload.as_ref(), &[16, 11, 1, 2]);
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decoder_discards_corrupted_frames() {
        let mut buf = encoded(Frame {
            cmd: CMD_FRAMEBUF,
            mac: 1,
            payload: Bytes::from_static(&[ACK]),
        });
        let checksum_at = buf.len() - 1;
        buf[checksum_at] ^= 0xff;
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decoder_waits_for_a_complete_frame() {
        let full = encoded(Frame {
            cmd: CMD_FRAMEBUF,
            mac: 2,
            payload: Bytes::from_static(&[ACK]),
        });
        let mut partial = BytesMut::from(&full[..full.len() - 2]);
        assert!(FrameCodec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 2..]);
        let frame = FrameCodec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.mac, 2);
    }
}

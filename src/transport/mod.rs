//! The Sensor Hub Transport Protocol (SHTP).
//!
//! SHTP moves *cargos*, logical payloads, across a byte link that can only
//! carry bounded *transfers*. Each transfer starts with a 4-byte header
//! carrying the declared length, a continuation flag, the channel number and
//! a per-channel sequence number; a cargo larger than one transfer is split
//! into an initial fragment followed by continuations.
//!
//! Channels are not fixed: the hub names them in its startup advertisement,
//! binding `(app GUID, channel name)` pairs to channel numbers. Upper layers
//! register listeners by *name* ([`Shtp::listen_channel`] /
//! [`Shtp::listen_advert`]); the transport joins the advertised tables with
//! the registered listeners and caches the resulting dispatch target per
//! channel, re-deriving the cache on every table change.
//!
//! The transport is generic over the listener token `L`, a small `Copy` type
//! the upper layer uses to tell its handlers apart. Reassembly happens in a
//! caller-owned [`Reassembly`] buffer so that a completed payload can still
//! be borrowed while the transport sends a reply.

pub mod advert;

use crate::hal::Hal;
use crate::utils::HexSlice;
use crate::Error;
use byteorder::{ByteOrder, LittleEndian};
use core::cmp;
use heapless::{String, Vec};

use self::advert::cstr;

/// Number of channel slots per hub.
pub const MAX_CHANNELS: usize = 8;
/// Number of app slots per hub.
pub const MAX_APPS: usize = 5;
/// Length of the frame header preceding every transfer.
pub const HEADER_LEN: usize = 4;
/// Largest reassembled cargo accepted from the hub.
pub const MAX_PAYLOAD_IN: usize = 1200 - HEADER_LEN;
/// Largest single transfer staged for transmission. HALs that can move more
/// per transaction are clamped to this.
pub const MAX_TRANSFER_OUT: usize = 256 - HEADER_LEN;

const NAME_LEN: usize = 32;
const VERSION_LEN: usize = 8;

const UNUSED_GUID: u32 = 0xFFFF_FFFF;
const GUID_SHTP: u32 = 0;
const CHAN_COMMAND: u8 = 0;

// Command-channel protocol: request and response ids.
const CMD_ADVERTISE: u8 = 0;
const CMD_ADVERTISE_ALL: u8 = 1;
const RESP_ADVERTISE: u8 = 0;

type Name = String<NAME_LEN>;

/// Dispatch target bound to a channel or an advertisement stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Endpoint<L> {
    /// The transport itself (command channel, transport advertisement tags).
    Transport,
    /// An upper-layer listener registered with the given token.
    App(L),
}

/// A completed cargo, ready for dispatch by the upper layer.
///
/// The payload bytes live in the [`Reassembly`] that was passed to
/// [`Shtp::assemble`].
#[derive(Debug, Copy, Clone)]
pub struct Delivery<L> {
    /// Listener bound to the channel the cargo arrived on.
    pub target: Endpoint<L>,
    /// Channel number the cargo arrived on.
    pub channel: u8,
    /// Payload length in bytes.
    pub len: u16,
    /// Timestamp of the interrupt that announced the cargo's first fragment.
    pub timestamp_us: u32,
}

/// Diagnostic counters. Dropped frames never propagate errors upward; they
/// are only visible here.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Inbound cargos larger than [`MAX_PAYLOAD_IN`].
    pub too_large_payloads: u32,
    /// Cargos abandoned because the HAL rejected a transfer.
    pub tx_discards: u32,
    /// Inbound fragments shorter than their own header claims possible.
    pub short_fragments: u32,
    /// Inbound fragments addressed to an out-of-range channel.
    pub bad_rx_chan: u32,
    /// Send attempts addressed to an out-of-range channel.
    pub bad_tx_chan: u32,
}

/// Advertisement solicitation phase.
///
/// The hub sends a full advertisement unsolicited after reset (`Needed`).
/// Registering an advert listener while `Idle` solicits a fresh round.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum AdvertPhase {
    Needed,
    Requested,
    Idle,
}

struct App {
    guid: u32,
    name: Name,
}

struct AdvertListener<L> {
    app: Name,
    target: Endpoint<L>,
}

struct ChanListener<L> {
    app: Name,
    chan: Name,
    target: Endpoint<L>,
}

struct Channel<L> {
    guid: u32,
    name: Name,
    wake: bool,
    next_out_seq: u8,
    next_in_seq: u8,
    /// Cached dispatch target. Derived from the apps, channels and listener
    /// tables; recomputed by `update_targets` on every table change.
    target: Option<Endpoint<L>>,
}

impl<L> Channel<L> {
    fn unused() -> Self {
        Channel {
            guid: UNUSED_GUID,
            name: Name::new(),
            wake: false,
            next_out_seq: 0,
            next_in_seq: 0,
            target: None,
        }
    }

    fn live(&self) -> bool {
        self.guid != UNUSED_GUID
    }
}

/// In-flight cargo reassembly state.
///
/// Owned by the caller rather than the transport so that the payload of a
/// completed [`Delivery`] can be borrowed while the transport is used to
/// send. The buffer stays valid until the next call to [`Shtp::assemble`].
pub struct Reassembly {
    buf: [u8; MAX_PAYLOAD_IN],
    cursor: u16,
    remaining: u16,
    chan: u8,
    timestamp_us: u32,
}

impl Reassembly {
    pub const fn new() -> Self {
        Reassembly {
            buf: [0; MAX_PAYLOAD_IN],
            cursor: 0,
            remaining: 0,
            chan: 0,
            timestamp_us: 0,
        }
    }

    /// The payload assembled by the most recent completed delivery.
    pub fn payload(&self) -> &[u8] {
        &self.buf[..usize::from(self.cursor)]
    }
}

impl Default for Reassembly {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport state for one hub.
pub struct Shtp<L> {
    version: String<VERSION_LEN>,
    advert_phase: AdvertPhase,

    /// Base outbound cap: HAL max transfer minus header, clamped to the
    /// staging buffer. Hub-advertised limits can only lower the caps below.
    out_cap: u16,
    out_max_payload: u16,
    out_max_transfer: u16,
    in_max_transfer: u16,
    out_transfer: [u8; MAX_TRANSFER_OUT + HEADER_LEN],

    apps: Vec<App, MAX_APPS>,
    advert_listeners: Vec<AdvertListener<L>, MAX_APPS>,
    channels: [Channel<L>; MAX_CHANNELS],
    chan_listeners: Vec<ChanListener<L>, MAX_CHANNELS>,

    stats: Stats,
}

impl<L: Copy> Shtp<L> {
    /// Creates the transport state for a link whose HAL can move
    /// `hal_max_transfer` bytes per transaction.
    ///
    /// The SHTP app and its command channel exist a priori; everything else
    /// is populated from the hub's advertisement.
    pub fn new(hal_max_transfer: usize) -> Self {
        let cap = cmp::min(hal_max_transfer, MAX_TRANSFER_OUT + HEADER_LEN)
            .saturating_sub(HEADER_LEN) as u16;
        let mut shtp = Shtp {
            version: String::new(),
            advert_phase: AdvertPhase::Needed,
            out_cap: cap,
            out_max_payload: cap,
            out_max_transfer: cap,
            in_max_transfer: cap,
            out_transfer: [0; MAX_TRANSFER_OUT + HEADER_LEN],
            apps: Vec::new(),
            advert_listeners: Vec::new(),
            channels: core::array::from_fn(|_| Channel::unused()),
            chan_listeners: Vec::new(),
            stats: Stats::default(),
        };

        // The SHTP app and command channel exist before any advertisement;
        // establish them here, with the transport itself listening on both.
        shtp.add_app(GUID_SHTP, "SHTP");
        shtp.add_channel(CHAN_COMMAND, GUID_SHTP, "command", false);
        let _ = shtp.register_advert_listener("SHTP", Endpoint::Transport);
        let _ = shtp.register_chan_listener("SHTP", "command", Endpoint::Transport);
        // Hub firmware advertises the command channel under the name
        // "control", which would otherwise unbind it on the first round.
        let _ = shtp.register_chan_listener("SHTP", "control", Endpoint::Transport);
        shtp
    }

    /// Registers a listener for the advertisement stream of the app named
    /// `app`, and solicits a fresh advertisement round if the current one is
    /// already over.
    pub fn listen_advert<H: Hal>(
        &mut self,
        hal: &mut H,
        app: &str,
        token: L,
    ) -> Result<(), Error> {
        if app.is_empty() {
            return Err(Error::BadParam);
        }
        self.register_advert_listener(app, Endpoint::App(token))?;

        // Arrange for a new set of advertisements for this listener.
        if self.advert_phase == AdvertPhase::Idle {
            match self.send(hal, CHAN_COMMAND, &[CMD_ADVERTISE, CMD_ADVERTISE_ALL]) {
                Ok(()) => self.advert_phase = AdvertPhase::Requested,
                Err(_) => self.advert_phase = AdvertPhase::Needed,
            }
        }
        Ok(())
    }

    /// Registers a listener for the channel `chan` of the app `app`.
    ///
    /// The binding becomes effective as soon as the advertisement names the
    /// channel, which may already have happened.
    pub fn listen_channel(&mut self, app: &str, chan: &str, token: L) -> Result<(), Error> {
        if app.is_empty() || chan.is_empty() {
            return Err(Error::BadParam);
        }
        self.register_chan_listener(app, chan, Endpoint::App(token))
    }

    /// Looks up the channel number currently bound to `(app, chan)`.
    pub fn channel_no(&self, app: &str, chan: &str) -> Option<u8> {
        let guid = self.apps.iter().find(|a| a.name.as_str() == app)?.guid;
        self.channels
            .iter()
            .position(|c| c.live() && c.guid == guid && c.name.as_str() == chan)
            .map(|i| i as u8)
    }

    /// Version string the hub reported for the transport itself.
    pub fn version(&self) -> &str {
        self.version.as_str()
    }

    /// Whether `channel` was advertised as wake-capable.
    pub fn wake_channel(&self, channel: u8) -> bool {
        self.channels
            .get(usize::from(channel))
            .map(|c| c.live() && c.wake)
            .unwrap_or(false)
    }

    /// Diagnostic counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Largest cargo currently accepted by [`Shtp::send`].
    pub fn max_cargo_out(&self) -> usize {
        usize::from(self.out_max_payload)
    }

    /// Sends one cargo on `channel`, fragmenting it into as many transfers
    /// as the negotiated transfer limit requires.
    ///
    /// Fragments carry contiguous per-channel sequence numbers; every
    /// fragment after the first has the continuation bit set. A HAL failure
    /// abandons the rest of the cargo.
    pub fn send<H: Hal>(&mut self, hal: &mut H, channel: u8, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > usize::from(self.out_max_payload) {
            return Err(Error::BadParam);
        }
        if usize::from(channel) >= MAX_CHANNELS {
            self.stats.bad_tx_chan += 1;
            return Err(Error::BadParam);
        }

        let max = usize::from(self.out_max_transfer);
        let mut continuation = false;
        let mut cursor = 0;
        let mut remaining = payload.len();

        while remaining > 0 {
            let len = cmp::min(remaining, max);
            let total = len + HEADER_LEN;

            let (header, body) = self.out_transfer.split_at_mut(HEADER_LEN);
            body[..len].copy_from_slice(&payload[cursor..cursor + len]);
            LittleEndian::write_u16(&mut header[..2], total as u16);
            if continuation {
                header[1] |= 0x80;
            }
            header[2] = channel;
            let chan = &mut self.channels[usize::from(channel)];
            header[3] = chan.next_out_seq;
            chan.next_out_seq = chan.next_out_seq.wrapping_add(1);

            if let Err(e) = hal.tx(&self.out_transfer[..total]) {
                // Throw away the rest of this cargo.
                self.stats.tx_discards += 1;
                return Err(e);
            }

            cursor += len;
            remaining -= len;
            continuation = true;
        }
        Ok(())
    }

    /// Feeds one received transfer into reassembly.
    ///
    /// Returns a [`Delivery`] when this transfer completed a cargo on a
    /// channel with a bound listener; the payload is then available from
    /// `rx.payload()`. Malformed or unexpected fragments are dropped and
    /// counted, never reported as errors.
    pub fn assemble(
        &mut self,
        rx: &mut Reassembly,
        transfer: &[u8],
        timestamp_us: u32,
    ) -> Option<Delivery<L>> {
        if transfer.len() < HEADER_LEN {
            self.stats.short_fragments += 1;
            return None;
        }
        let declared = usize::from(LittleEndian::read_u16(&transfer[..2]) & 0x7FFF);
        let continuation = transfer[1] & 0x80 != 0;
        let channel = transfer[2];
        let seq = transfer[3];

        if declared < HEADER_LEN {
            self.stats.short_fragments += 1;
            return None;
        }
        if usize::from(channel) >= MAX_CHANNELS {
            self.stats.bad_rx_chan += 1;
            return None;
        }

        if rx.remaining > 0 {
            // Check this fragment against the assembly in progress; on any
            // mismatch the partial payload is discarded, never merged.
            if !continuation
                || channel != rx.chan
                || seq != self.channels[usize::from(channel)].next_in_seq
            {
                debug!("shtp: discarding partial cargo on channel {}", rx.chan);
                rx.remaining = 0;
            }
        }

        if rx.remaining == 0 {
            if continuation {
                // Continuation of something we don't have.
                return None;
            }
            if declared - HEADER_LEN > MAX_PAYLOAD_IN {
                self.stats.too_large_payloads += 1;
                return None;
            }

            // A new cargo begins; it is stamped with its first fragment.
            rx.timestamp_us = timestamp_us;
            rx.cursor = 0;
            rx.chan = channel;
        }

        // Only the declared portion of the transfer is cargo.
        let len = cmp::min(transfer.len(), declared);
        let body = len - HEADER_LEN;
        let space = MAX_PAYLOAD_IN - usize::from(rx.cursor);
        if body > space {
            // Continuations declared more than the initial fragment did.
            self.stats.too_large_payloads += 1;
            rx.remaining = 0;
            return None;
        }
        rx.buf[usize::from(rx.cursor)..][..body]
            .copy_from_slice(&transfer[HEADER_LEN..HEADER_LEN + body]);
        rx.cursor += body as u16;
        rx.remaining = (declared - len) as u16;

        let mut delivery = None;
        if rx.remaining == 0 {
            trace!("shtp: cargo on channel {}: {:?}", channel, HexSlice(rx.payload()));
            if let Some(target) = self.channels[usize::from(channel)].target {
                delivery = Some(Delivery {
                    target,
                    channel,
                    len: rx.cursor,
                    timestamp_us: rx.timestamp_us,
                });
            }
        }

        self.channels[usize::from(channel)].next_in_seq = seq.wrapping_add(1);
        delivery
    }

    /// Processes a payload delivered to the transport's own command channel.
    ///
    /// Advertisement TLVs belonging to apps with a registered upper-layer
    /// listener are forwarded through `on_advert` in stream order, followed
    /// by a `(TAG_NULL, [])` terminator per app.
    pub fn process_command(&mut self, payload: &[u8], on_advert: &mut dyn FnMut(L, u8, &[u8])) {
        let Some((&response, tlvs)) = payload.split_first() else {
            return;
        };
        match response {
            RESP_ADVERTISE => self.process_advertisement(tlvs, on_advert),
            _ => trace!("shtp: unknown command-channel response {}", response),
        }
    }

    fn process_advertisement(&mut self, tlvs: &[u8], on_advert: &mut dyn FnMut(L, u8, &[u8])) {
        let mut guid = GUID_SHTP;
        let mut chan_no = 0u8;
        let mut wake = false;

        self.advert_phase = AdvertPhase::Idle;

        for tlv in advert::TlvReader::new(tlvs) {
            match tlv.tag {
                advert::TAG_NULL => {
                    // Reserved value, not a valid tag.
                }
                advert::TAG_GUID => {
                    // A new GUID is being established; terminate the
                    // advertisement stream of the earlier app, if any.
                    self.call_advert(guid, advert::TAG_NULL, &[], on_advert);
                    guid = tlv
                        .value
                        .get(..4)
                        .map(|v| LittleEndian::read_u32(v))
                        .unwrap_or(UNUSED_GUID);
                }
                advert::TAG_NORMAL_CHANNEL => {
                    chan_no = tlv.value.first().copied().unwrap_or(0);
                    wake = false;
                }
                advert::TAG_WAKE_CHANNEL => {
                    chan_no = tlv.value.first().copied().unwrap_or(0);
                    wake = true;
                }
                advert::TAG_APP_NAME => {
                    self.add_app(guid, cstr(tlv.value));
                    // Now that the GUID and a registered app are potentially
                    // linked, open the advertisement stream with the app.
                    self.call_advert(guid, advert::TAG_GUID, &guid.to_le_bytes(), on_advert);
                }
                advert::TAG_CHANNEL_NAME => {
                    self.add_channel(chan_no, guid, cstr(tlv.value), wake);
                }
                _ => {}
            }

            // Deliver the TLV entry to the app's listener.
            self.call_advert(guid, tlv.tag, tlv.value, on_advert);
        }

        // Terminate the advertisement stream of the last app.
        self.call_advert(guid, advert::TAG_NULL, &[], on_advert);
    }

    fn call_advert(
        &mut self,
        guid: u32,
        tag: u8,
        value: &[u8],
        on_advert: &mut dyn FnMut(L, u8, &[u8]),
    ) {
        let target = {
            let Some(app) = self.apps.iter().find(|a| a.guid == guid) else {
                // Can't associate an app name with this GUID yet.
                return;
            };
            self.advert_listeners
                .iter()
                .find(|l| l.app == app.name)
                .map(|l| l.target)
        };
        match target {
            Some(Endpoint::Transport) => self.on_shtp_advert(tag, value),
            Some(Endpoint::App(token)) => on_advert(token, tag, value),
            None => {}
        }
    }

    /// Handles the transport's own advertisement tags (GUID 0).
    fn on_shtp_advert(&mut self, tag: u8, value: &[u8]) {
        let cap = |value: &[u8]| {
            value
                .get(..2)
                .map(|v| LittleEndian::read_u16(v).saturating_sub(HEADER_LEN as u16))
        };
        match tag {
            advert::TAG_MAX_CARGO_PLUS_HEADER_WRITE => {
                if let Some(x) = cap(value) {
                    if x < self.out_cap {
                        self.out_max_payload = x;
                    }
                }
            }
            advert::TAG_MAX_CARGO_PLUS_HEADER_READ => {
                // Inbound cargos are bounded by MAX_PAYLOAD_IN regardless.
            }
            advert::TAG_MAX_TRANSFER_WRITE => {
                if let Some(x) = cap(value) {
                    self.out_max_transfer = cmp::min(x, self.out_cap);
                }
            }
            advert::TAG_MAX_TRANSFER_READ => {
                if let Some(x) = cap(value) {
                    if x < self.in_max_transfer {
                        self.in_max_transfer = x;
                    }
                }
            }
            advert::TAG_SHTP_VERSION => {
                self.version = bounded(cstr(value));
            }
            _ => {}
        }
    }

    fn register_advert_listener(&mut self, app: &str, target: Endpoint<L>) -> Result<(), Error> {
        self.advert_listeners
            .push(AdvertListener { app: bounded(app), target })
            .map_err(|_| Error::BadParam)
    }

    fn register_chan_listener(
        &mut self,
        app: &str,
        chan: &str,
        target: Endpoint<L>,
    ) -> Result<(), Error> {
        self.chan_listeners
            .push(ChanListener {
                app: bounded(app),
                chan: bounded(chan),
                target,
            })
            .map_err(|_| Error::BadParam)?;
        self.update_targets();
        Ok(())
    }

    fn add_app(&mut self, guid: u32, name: &str) {
        if self.apps.iter().any(|a| a.guid == guid) {
            return;
        }
        if self.apps.push(App { guid, name: bounded(name) }).is_err() {
            warn!("shtp: app table full, dropping {:?}", name);
            return;
        }
        self.update_targets();
    }

    fn add_channel(&mut self, chan_no: u8, guid: u32, name: &str, wake: bool) {
        let Some(chan) = self.channels.get_mut(usize::from(chan_no)) else {
            warn!("shtp: advertised channel {} out of range", chan_no);
            return;
        };
        chan.guid = guid;
        chan.name = bounded(name);
        chan.wake = wake;
        chan.next_out_seq = 0;
        chan.next_in_seq = 0;
        chan.target = None;
        self.update_targets();
    }

    /// Re-derives each channel's cached dispatch target.
    ///
    /// Channel → (GUID, channel name); GUID → app name;
    /// (app name, channel name) → listener.
    fn update_targets(&mut self) {
        for chan in self.channels.iter_mut() {
            chan.target = None;
            if !chan.live() {
                continue;
            }
            let Some(app) = self.apps.iter().find(|a| a.guid == chan.guid) else {
                // No app registered with this GUID yet.
                continue;
            };
            chan.target = self
                .chan_listeners
                .iter()
                .find(|l| l.app == app.name && l.chan == chan.name)
                .map(|l| l.target);
        }
    }
}

/// Bound-copies a hub-supplied name into a fixed-capacity string.
fn bounded<const N: usize>(s: &str) -> String<N> {
    let mut name = String::new();
    for c in s.chars() {
        if name.push(c).is_err() {
            break;
        }
    }
    name
}

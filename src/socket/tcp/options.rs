use super::congestion::DEF_SSTHRESH;
use super::tcb::{DEFAULT_MSS, MIN_MSS, Tcb};
use crate::config::SACK_MAX_BLOCK_COUNT;
use crate::wire::{TcpFlags, TcpOption, TcpSeqNumber};

/// The options of one inbound segment, decoded before any of them takes effect.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct Options {
    pub max_seg_size: Option<usize>,
    pub sack_permitted: bool,
    pub sack_blocks: [Option<(TcpSeqNumber, TcpSeqNumber)>; SACK_MAX_BLOCK_COUNT],
    /// Parsing stopped early at an option that did not make sense.
    pub malformed: bool,
}

impl Options {
    /// Decode the option area of a segment carrying `flags`.
    ///
    /// MSS and SACK-permitted are only meaningful on a SYN. Anything that
    /// cannot be decoded ends the scan; what came before it is kept.
    pub fn parse(flags: TcpFlags, mut options: &[u8]) -> Options {
        let syn = flags.contains(TcpFlags::SYN);
        let mut parsed = Options::default();
        while !options.is_empty() {
            let Ok((rest, option)) = TcpOption::parse(options) else {
                parsed.malformed = true;
                break;
            };
            match option {
                TcpOption::EndOfList => break,
                TcpOption::NoOperation => (),
                TcpOption::MaxSegmentSize(mss) if syn && mss != 0 => {
                    parsed.max_seg_size = Some(mss as usize)
                }
                TcpOption::SackPermitted if syn => parsed.sack_permitted = true,
                TcpOption::MaxSegmentSize(_) | TcpOption::SackPermitted => {
                    parsed.malformed = true;
                    break;
                }
                TcpOption::SackRange(ranges) => {
                    for (block, range) in parsed.sack_blocks.iter_mut().zip(ranges) {
                        *block = range.map(|(left, right)| {
                            (TcpSeqNumber(left as i32), TcpSeqNumber(right as i32))
                        });
                    }
                }
                TcpOption::Unknown { .. } => (),
            }
            options = rest;
        }

        if parsed.malformed {
            net_debug!("malformed TCP option, ignoring the rest");
        }
        parsed
    }
}

impl Tcb {
    /// Merge the options of a segment acknowledging `ack` into the connection.
    pub(super) fn apply_options(&mut self, options: &Options, flags: TcpFlags, ack: TcpSeqNumber) {
        if options.sack_blocks.iter().any(Option::is_some) {
            self.update_scoreboard(ack, &options.sack_blocks);
        }

        if flags.contains(TcpFlags::SYN) {
            self.sack = self.config.sack && options.sack_permitted;
            let peer_mss = options.max_seg_size.unwrap_or(DEFAULT_MSS);
            self.mss = self.mss.min(peer_mss.max(MIN_MSS));
            self.c_win = 2 * self.mss;
            self.ss_thresh = DEF_SSTHRESH;
            tcp_trace!("negotiated mss={} sack={}", self.mss, self.sack);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::socket::tcp::Config;

    #[test]
    fn test_parse_syn_options() {
        let bytes = [0x02, 0x04, 0x05, 0xb4, 0x01, 0x01, 0x04, 0x02];
        let options = Options::parse(TcpFlags::SYN, &bytes);
        assert_eq!(options.max_seg_size, Some(1460));
        assert!(options.sack_permitted);
        assert!(!options.malformed);
    }

    #[test]
    fn test_mss_without_syn() {
        let bytes = [0x04, 0x02, 0x02, 0x04, 0x05, 0xb4];
        let options = Options::parse(TcpFlags::ACK, &bytes);
        assert_eq!(options.max_seg_size, None);
        assert!(!options.sack_permitted);
        assert!(options.malformed);
    }

    #[test]
    fn test_malformed_keeps_prefix() {
        // MSS, then an option whose length runs past the end.
        let bytes = [0x02, 0x04, 0x02, 0x00, 0x08, 0x0a, 0x00];
        let options = Options::parse(TcpFlags::SYN, &bytes);
        assert_eq!(options.max_seg_size, Some(512));
        assert!(options.malformed);
    }

    #[test]
    fn test_zero_mss_rejected() {
        let bytes = [0x02, 0x04, 0x00, 0x00];
        let options = Options::parse(TcpFlags::SYN, &bytes);
        assert_eq!(options.max_seg_size, None);
        assert!(options.malformed);
    }

    #[test]
    fn test_sack_blocks() {
        let bytes = [
            0x01, 0x01, 0x05, 0x12, 0x00, 0x00, 0x03, 0xe8, 0x00, 0x00, 0x07, 0xd0, 0x00, 0x00,
            0x0b, 0xb8, 0x00, 0x00, 0x0f, 0xa0,
        ];
        let options = Options::parse(TcpFlags::ACK, &bytes);
        assert_eq!(
            options.sack_blocks,
            [
                Some((TcpSeqNumber(1000), TcpSeqNumber(2000))),
                Some((TcpSeqNumber(3000), TcpSeqNumber(4000))),
                None,
                None
            ]
        );
    }

    #[test]
    fn test_apply_syn_options() {
        let mut tcb = Tcb::new(Config::default());
        tcb.mss = 1460;
        let options = Options {
            max_seg_size: Some(1200),
            sack_permitted: true,
            ..Options::default()
        };
        tcb.apply_options(&options, TcpFlags::SYN, TcpSeqNumber(0));
        assert_eq!(tcb.mss, 1200);
        assert_eq!(tcb.c_win, 2400);
        assert!(tcb.sack);

        // No MSS option means the conservative default.
        let mut tcb = Tcb::new(Config::default());
        tcb.mss = 1460;
        tcb.apply_options(&Options::default(), TcpFlags::SYN, TcpSeqNumber(0));
        assert_eq!(tcb.mss, DEFAULT_MSS);
        assert!(!tcb.sack);
    }

    #[test]
    fn test_tiny_mss_clamped() {
        let mut tcb = Tcb::new(Config::default());
        tcb.mss = 1460;
        let options = Options::parse(TcpFlags::SYN, &[0x02, 0x04, 0x00, 0x08, 0x04, 0x02]);
        assert_eq!(options.max_seg_size, Some(8));
        tcb.apply_options(&options, TcpFlags::SYN, TcpSeqNumber(0));
        assert_eq!(tcb.mss, MIN_MSS);
        assert!(tcb.sack);
    }

    #[test]
    fn test_sack_needs_local_consent() {
        let mut tcb = Tcb::new(Config {
            sack: false,
            ..Config::default()
        });
        let options = Options {
            sack_permitted: true,
            ..Options::default()
        };
        tcb.apply_options(&options, TcpFlags::SYN, TcpSeqNumber(0));
        assert!(!tcb.sack);
    }
}

use super::input::Segment;
use super::tcb::Tcb;
use crate::wire::TcpFlags;

impl Tcb {
    /// Whether `seq` may start a segment: inside the receive window, or exactly
    /// at its edge when the window is closed.
    pub(super) fn in_window(&self, seq: crate::wire::TcpSeqNumber) -> bool {
        if self.recv_win == 0 {
            seq == self.recv_next
        } else {
            self.recv_next <= seq && seq < self.recv_next + self.recv_win
        }
    }

    /// Clip `seg` to the receive window.
    ///
    /// Octets below `recv_next` are dropped from the front (the SYN first),
    /// octets past the right edge from the back (the FIN first), and URG is
    /// cleared once the urgent pointer no longer falls in the segment.
    /// Returns whether what remains is acceptable. A segment that carried
    /// sequence space but has none left solicits an immediate ACK.
    pub(super) fn trim(&mut self, seg: &mut Segment) -> bool {
        let ack_only = seg.len == 0;

        // Left edge
        let mut drop = self.recv_next - seg.seq;
        if 0 < drop {
            if seg.flags.contains(TcpFlags::SYN) {
                seg.flags.remove(TcpFlags::SYN);
                seg.seq += 1;
                seg.len -= 1;
                if 1 < seg.urg {
                    seg.urg -= 1;
                } else {
                    seg.flags.remove(TcpFlags::URG);
                }
                drop -= 1;
            }

            let mut drop = drop as usize;
            if seg.len <= drop {
                seg.flags.remove(TcpFlags::FIN);
                drop = seg.len;
            }
            if 0 < drop {
                seg.seq += drop;
                seg.len -= drop;
                seg.offset += drop;
                if drop < seg.urg {
                    seg.urg -= drop;
                } else {
                    seg.flags.remove(TcpFlags::URG);
                    seg.urg = 0;
                }
            }
        }

        // Right edge
        let drop = (seg.seq + seg.len) - (self.recv_next + self.recv_win);
        if 0 < drop {
            let mut drop = drop as usize;
            if seg.flags.contains(TcpFlags::FIN) {
                seg.flags.remove(TcpFlags::FIN);
                seg.len -= 1;
                drop -= 1;
            }
            seg.len -= drop.min(seg.len);
        }

        if 0 < seg.len {
            debug_assert!(0 < self.recv_win);
            return true;
        }

        if !ack_only {
            tcp_trace!("segment at {} trimmed to nothing, acking", seg.seq);
            self.ack_now = true;
        }
        self.in_window(seg.seq)
    }
}

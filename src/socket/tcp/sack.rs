use heapless::Vec;

use super::State;
use super::congestion::RXMIT_THRESH;
use super::tcb::Tcb;
use crate::config::SACK_MAX_BLOCK_COUNT;
use crate::wire::TcpSeqNumber;

/// A run of sent octets the peer has not reported as received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Hole {
    pub start: TcpSeqNumber,
    pub end: TcpSeqNumber,
    /// SACK blocks seen above this hole, saturating at the retransmit threshold.
    pub dup_acks: u32,
    /// Next octet of the hole to retransmit.
    pub rxmit: TcpSeqNumber,
}

impl Hole {
    /// A hole just below a block of `sacked` octets.
    fn new(start: TcpSeqNumber, end: TcpSeqNumber, sacked: usize, mss: usize) -> Hole {
        Hole {
            start,
            end,
            dup_acks: (sacked / mss).clamp(1, RXMIT_THRESH as usize) as u32,
            rxmit: start,
        }
    }

    fn count_dup_ack(&mut self, sacked_above: usize, mss: usize) {
        self.dup_acks += 1;
        if RXMIT_THRESH as usize <= sacked_above / mss {
            self.dup_acks = RXMIT_THRESH;
        }
    }
}

/// The sender's view of what the peer holds above `send_una` (RFC 6675).
#[derive(Debug, Default, Clone)]
pub(super) struct Scoreboard {
    pub holes: Vec<Hole, SACK_MAX_BLOCK_COUNT>,
    /// Right edge of the highest block reported so far.
    pub last_sack: TcpSeqNumber,
}

impl Scoreboard {
    pub fn clear(&mut self) {
        self.holes.clear();
    }

    /// Octets retransmitted from holes and not yet covered by the peer.
    pub fn rxmit_data(&self) -> usize {
        self.holes
            .iter()
            .map(|hole| hole.rxmit.distance_from(hole.start))
            .sum()
    }
}

impl Tcb {
    /// Fold the SACK blocks of a segment acknowledging `ack` into the scoreboard.
    pub(super) fn update_scoreboard(
        &mut self,
        ack: TcpSeqNumber,
        blocks: &[Option<(TcpSeqNumber, TcpSeqNumber)>],
    ) {
        if !self.sack || self.send_max < ack || ack < self.send_una {
            return;
        }

        let mss = self.mss;
        for &(start, end) in blocks.iter().flatten() {
            // Malformed, old, D-SACK or beyond what was sent.
            if end <= start || end <= self.send_una || start <= ack || self.send_max < end {
                continue;
            }
            if self.send_fack < end {
                self.send_fack = end;
            }

            let board = &mut self.scoreboard;
            if board.holes.is_empty() {
                let hole = Hole::new(ack, start, end.distance_from(start), mss);
                if board.holes.push(hole).is_err() {
                    net_debug!("scoreboard: too many holes, dropping {}..{}", ack, start);
                }
                board.last_sack = end;
                continue;
            }

            let mut i = 0;
            while i < board.holes.len() {
                let hole = &mut board.holes[i];
                if end <= hole.start {
                    break;
                }
                if hole.end <= start {
                    hole.count_dup_ack(end.distance_from(hole.end), mss);
                    i += 1;
                    continue;
                }
                if start <= hole.start {
                    if hole.end <= end {
                        // Block covers the hole.
                        board.holes.remove(i);
                        continue;
                    }
                    // Block covers the front of the hole.
                    hole.start = end;
                    hole.rxmit = hole.rxmit.max(hole.start);
                    i += 1;
                    continue;
                }
                if hole.end <= end {
                    // Block covers the back of the hole.
                    hole.end = start;
                    hole.rxmit = hole.rxmit.min(hole.end);
                    hole.count_dup_ack(end.distance_from(start), mss);
                    i += 1;
                    continue;
                }

                // Block splits the hole in two.
                let right = Hole {
                    start: end,
                    end: hole.end,
                    dup_acks: hole.dup_acks,
                    rxmit: hole.rxmit.max(end),
                };
                hole.end = start;
                hole.rxmit = hole.rxmit.min(hole.end);
                hole.count_dup_ack(end.distance_from(start), mss);
                if board.holes.is_full() {
                    if i + 1 < board.holes.len() {
                        // Forget the highest hole to make room.
                        if let Some(last) = board.holes.pop() {
                            board.last_sack = last.start;
                        }
                    } else {
                        board.last_sack = end;
                        i += 1;
                        continue;
                    }
                }
                if board.holes.insert(i + 1, right).is_err() {
                    net_debug!("scoreboard: too many holes, dropping {}..{}", end, right.end);
                }
                i += 2;
            }

            if board.last_sack < start && !board.holes.is_full() {
                // A new hole between the highest block so far and this one.
                let hole = Hole::new(board.last_sack, start, end.distance_from(start), mss);
                if board.holes.push(hole).is_err() {
                    net_debug!("scoreboard: too many holes, dropping {}..{}", hole.start, start);
                }
                board.last_sack = end;
            }
        }

        self.rxmit_data = self.scoreboard.rxmit_data();
        self.send_awin = (self.send_next - self.send_fack).max(0) as usize + self.rxmit_data;
        tcp_trace!(
            "sack: holes={} fack={} awin={}",
            self.scoreboard.holes.len(),
            self.send_fack,
            self.send_awin
        );
    }

    /// Drop holes the cumulative ACK has covered.
    pub(super) fn delete_sack_holes(&mut self, ack: TcpSeqNumber) {
        if !self.sack || self.state == State::Listen || self.send_max < ack {
            return;
        }

        let last_ack = self.send_una.max(ack);
        let board = &mut self.scoreboard;
        while board.holes.first().is_some_and(|hole| hole.end <= last_ack) {
            board.holes.remove(0);
        }
        if let Some(hole) = board.holes.first_mut() {
            if hole.start < last_ack {
                hole.start = last_ack;
                hole.rxmit = hole.rxmit.max(hole.start);
            }
        }
        self.rxmit_data = self.scoreboard.rxmit_data();
    }

    /// Index of the oldest hole that is due for retransmission.
    pub(super) fn next_hole(&self) -> Option<usize> {
        self.scoreboard.holes.iter().position(|hole| {
            hole.rxmit < hole.end
                && (self.fast_rxmit || RXMIT_THRESH <= hole.dup_acks)
                && self.send_una <= hole.rxmit
        })
    }
}

/// A small pseudo random generator, used to key initial sequence numbers.
#[derive(Debug, Clone)]
pub struct Rand {
    state: u64,
}

impl Rand {
    pub const fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn rand_u32(&mut self) -> u32 {
        // sPCG32 from https://www.pcg-random.org/paper.html
        // see also https://nullprogram.com/blog/2017/09/21/
        const M: u64 = 0xbb2efcec3c39611d;
        const A: u64 = 0x7590ef39;

        let s = self.state.wrapping_mul(M).wrapping_add(A);
        self.state = s;

        let shift = 29 - (s >> 61);
        (s >> shift) as u32
    }

    pub fn rand_u64(&mut self) -> u64 {
        (self.rand_u32() as u64) << 32 | self.rand_u32() as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rand_deterministic() {
        let mut a = Rand::new(1234);
        let mut b = Rand::new(1234);
        for _ in 0..16 {
            assert_eq!(a.rand_u32(), b.rand_u32());
        }
    }

    #[test]
    fn test_rand_varies() {
        let mut r = Rand::new(1);
        let x = r.rand_u64();
        let y = r.rand_u64();
        assert_ne!(x, y);
    }
}

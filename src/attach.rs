use nix::unistd::Pid;

/// Highest pid the monitor will ever track. Matches the platform's
/// kernel.pid_max, so the whole set fits in 4 KiB.
pub const PID_MAX: usize = 32768;

const WORDS: usize = PID_MAX / 64;

/// Dense "this pid is attached to us and owes us a stop notification" set
/// over `[1, PID_MAX]`. Only the monitor thread touches it.
pub(crate) struct AttachBitmap {
    bits: Box<[u64; WORDS]>,
}

impl AttachBitmap {
    pub fn new() -> Self {
        Self {
            bits: Box::new([0; WORDS]),
        }
    }

    fn slot(pid: Pid) -> (usize, u64) {
        let p = pid.as_raw();
        assert!(
            p >= 1 && p as usize <= PID_MAX,
            "pid {p} outside the trackable range"
        );
        let bit = p as usize - 1;
        (bit / 64, 1 << (bit % 64))
    }

    pub fn set(&mut self, pid: Pid) {
        let (word, mask) = Self::slot(pid);
        self.bits[word] |= mask;
    }

    pub fn clear(&mut self, pid: Pid) {
        let (word, mask) = Self::slot(pid);
        self.bits[word] &= !mask;
    }

    pub fn test(&self, pid: Pid) -> bool {
        let (word, mask) = Self::slot(pid);
        self.bits[word] & mask != 0
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(0);
    }

    /// Take every set pid, leaving the set empty. Teardown detaches these.
    pub fn drain(&mut self) -> Vec<Pid> {
        let mut pids = Vec::new();
        for (word, bits) in self.bits.iter().enumerate() {
            let mut bits = *bits;
            while bits != 0 {
                let low = bits.trailing_zeros() as usize;
                pids.push(Pid::from_raw((word * 64 + low + 1) as i32));
                bits &= bits - 1;
            }
        }
        self.clear_all();
        pids
    }
}

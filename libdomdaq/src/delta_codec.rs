use super::error::DeltaCodecError;

/// Code width ladder as (bits per word, narrowing threshold).
///
/// An escape word widens one step, a delta smaller in magnitude than the
/// threshold narrows one step.
const LADDER: [(u32, i32); 5] = [(1, 0), (2, 1), (3, 2), (6, 4), (11, 32)];
/// Every call to decode (or encode) begins at 3 bits per word
const START_STEP: usize = 2;

/// DeltaCodec decodes the adaptive-width differential compression used by the DOM
/// for its ATWD and FADC waveforms.
///
/// Words are packed least-significant bit first into bytes. The bit register persists
/// between calls to [`DeltaCodec::decode`], so the FADC and ATWD waveforms of a hit are
/// read back to back from one codec, while the code width restarts for every waveform.
#[derive(Debug)]
pub struct DeltaCodec<'a> {
    tape: &'a [u8],
    position: usize,
    register: u64,
    valid_bits: u32,
    step: usize,
}

impl<'a> DeltaCodec<'a> {
    /// Create a codec over a compressed buffer
    pub fn new(tape: &'a [u8]) -> Self {
        Self {
            tape,
            position: 0,
            register: 0,
            valid_bits: 0,
            step: START_STEP,
        }
    }

    /// Decode exactly `length` samples.
    ///
    /// Returns the running sum of the decoded deltas. Bits left over in the register
    /// after the last sample are kept for the next call; nothing checks that they are
    /// consumed.
    pub fn decode(&mut self, length: usize) -> Result<Vec<i32>, DeltaCodecError> {
        self.step = START_STEP;
        let mut last: i32 = 0;
        let mut out = Vec::with_capacity(length);
        for idx in 0..length {
            let delta = loop {
                let word = self.get_bits().ok_or(DeltaCodecError::Exhausted {
                    decoded: idx,
                    requested: length,
                })?;
                if word != self.escape() {
                    break word;
                }
                self.shift_up()?;
            };
            if delta.abs() < self.threshold() {
                self.shift_down()?;
            }
            last += delta;
            out.push(last);
        }
        Ok(out)
    }

    /// Current code width in bits
    pub fn code_width(&self) -> u32 {
        LADDER[self.step].0
    }

    /// Current narrowing threshold
    pub fn threshold(&self) -> i32 {
        LADDER[self.step].1
    }

    fn escape(&self) -> i32 {
        1 << (self.code_width() - 1)
    }

    fn get_bits(&mut self) -> Option<i32> {
        let bpw = self.code_width();
        while self.valid_bits < bpw {
            let next_byte = *self.tape.get(self.position)?;
            self.position += 1;
            self.register |= (next_byte as u64) << self.valid_bits;
            self.valid_bits += 8;
        }
        let mut value = (self.register & ((1 << bpw) - 1)) as i32;
        if value > (1 << (bpw - 1)) {
            value -= 1 << bpw;
        }
        self.register >>= bpw;
        self.valid_bits -= bpw;
        Some(value)
    }

    fn shift_up(&mut self) -> Result<(), DeltaCodecError> {
        if self.step + 1 >= LADDER.len() {
            return Err(DeltaCodecError::WidthOverflow(self.code_width()));
        }
        self.step += 1;
        Ok(())
    }

    fn shift_down(&mut self) -> Result<(), DeltaCodecError> {
        if self.step == 0 {
            return Err(DeltaCodecError::WidthUnderflow(self.code_width()));
        }
        self.step -= 1;
        Ok(())
    }
}

/// The inverse of [`DeltaCodec`].
///
/// Used to build compressed waveforms for simulated hits. Successive calls to
/// [`DeltaEncoder::encode`] share the bit register just as decoding does.
#[derive(Debug, Default)]
pub struct DeltaEncoder {
    bytes: Vec<u8>,
    register: u64,
    valid_bits: u32,
}

impl DeltaEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one waveform to the stream
    pub fn encode(&mut self, samples: &[i32]) -> Result<(), DeltaCodecError> {
        let mut step = START_STEP;
        let mut last: i32 = 0;
        for &sample in samples {
            let delta = sample - last;
            loop {
                let (bpw, _) = LADDER[step];
                let escape = 1i32 << (bpw - 1);
                if delta.abs() < escape {
                    break;
                }
                if step + 1 >= LADDER.len() {
                    return Err(DeltaCodecError::DeltaOutOfRange(delta as i64));
                }
                self.put_bits(escape, bpw);
                step += 1;
            }
            let (bpw, bth) = LADDER[step];
            self.put_bits(delta, bpw);
            if delta.abs() < bth {
                step -= 1;
            }
            last = sample;
        }
        Ok(())
    }

    /// Flush the partial byte (zero padded) and return the compressed stream
    pub fn finish(mut self) -> Vec<u8> {
        if self.valid_bits > 0 {
            self.bytes.push((self.register & 0xff) as u8);
        }
        self.bytes
    }

    fn put_bits(&mut self, value: i32, bpw: u32) {
        let bits = (value as u64) & ((1 << bpw) - 1);
        self.register |= bits << self.valid_bits;
        self.valid_bits += bpw;
        while self.valid_bits >= 8 {
            self.bytes.push((self.register & 0xff) as u8);
            self.register >>= 8;
            self.valid_bits -= 8;
        }
    }
}

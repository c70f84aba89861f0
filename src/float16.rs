//! Half-precision (IEEE-754 binary16) codec.
//!
//! Table-driven conversion after Jeroen van der Zijp, "Fast Half Float
//! Conversions" (<http://www.fox-toolkit.org/ftp/fasthalffloatconversion.pdf>).
//! Bit-exact including subnormals, infinities, and NaN propagation; the
//! tables are built once on first use.

use once_cell::sync::Lazy;

struct NarrowTables {
    base: [u16; 512],
    shift: [u8; 512],
}

struct WidenTables {
    mantissa: [u32; 2048],
    offset: [u16; 64],
    exponent: [u32; 64],
}

static NARROW: Lazy<NarrowTables> = Lazy::new(|| {
    let mut base = [0u16; 512];
    let mut shift = [0u8; 512];
    for i in 0..256usize {
        let e = i as i32 - 127;
        if e < -24 {
            // very small numbers map to zero
            base[i] = 0x0000;
            base[i | 0x100] = 0x8000;
            shift[i] = 24;
            shift[i | 0x100] = 24;
        } else if e < -14 {
            // small numbers map to denormals
            base[i] = 0x0400 >> (-e - 14);
            base[i | 0x100] = (0x0400 >> (-e - 14)) | 0x8000;
            shift[i] = (-e - 1) as u8;
            shift[i | 0x100] = (-e - 1) as u8;
        } else if e <= 15 {
            // normal numbers just lose precision
            base[i] = ((e + 15) << 10) as u16;
            base[i | 0x100] = ((e + 15) << 10) as u16 | 0x8000;
            shift[i] = 13;
            shift[i | 0x100] = 13;
        } else if e < 128 {
            // large numbers map to infinity
            base[i] = 0x7c00;
            base[i | 0x100] = 0xfc00;
            shift[i] = 24;
            shift[i | 0x100] = 24;
        } else {
            // infinities and NaNs stay as they are
            base[i] = 0x7c00;
            base[i | 0x100] = 0xfc00;
            shift[i] = 13;
            shift[i | 0x100] = 13;
        }
    }
    NarrowTables { base, shift }
});

static WIDEN: Lazy<WidenTables> = Lazy::new(|| {
    fn convert_mantissa(i: u32) -> u32 {
        let mut m = i << 13; // zero-pad mantissa bits
        let mut e: u32 = 0;
        while m & 0x0080_0000 == 0 {
            // normalize
            e = e.wrapping_sub(0x0080_0000); // decrement exponent (1 << 23)
            m <<= 1;
        }
        m &= !0x0080_0000; // clear leading 1 bit
        e = e.wrapping_add(0x3880_0000); // adjust bias ((127-14) << 23)
        m | e
    }

    let mut mantissa = [0u32; 2048];
    for i in 1..2048u32 {
        mantissa[i as usize] = if i < 1024 {
            convert_mantissa(i)
        } else {
            0x3800_0000 + ((i - 1024) << 13)
        };
    }
    let mut exponent = [0u32; 64];
    exponent[32] = 0x8000_0000;
    exponent[31] = 0x4780_0000;
    exponent[63] = 0xc780_0000;
    for i in 1..=30u32 {
        exponent[i as usize] = i << 23;
    }
    for i in 33..=62u32 {
        exponent[i as usize] = 0x8000_0000 + ((i - 32) << 23);
    }
    let mut offset = [1024u16; 64];
    offset[0] = 0;
    offset[32] = 0;
    WidenTables {
        mantissa,
        offset,
        exponent,
    }
});

/// Convert an `f32` to its packed binary16 bit pattern.
#[must_use]
pub fn to_half(v: f32) -> u16 {
    let f = v.to_bits();
    let t = &*NARROW;
    let idx = ((f >> 23) & 0x1ff) as usize;
    t.base[idx] | ((f & 0x007f_ffff) >> t.shift[idx]) as u16
}

/// Convert a packed binary16 bit pattern to `f32`.
#[must_use]
pub fn from_half(h: u16) -> f32 {
    let t = &*WIDEN;
    let hi = (h >> 10) as usize;
    let bits = t.mantissa[t.offset[hi] as usize + (h & 0x3ff) as usize]
        .wrapping_add(t.exponent[hi]);
    f32::from_bits(bits)
}

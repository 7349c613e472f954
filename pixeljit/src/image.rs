//! Strided image buffers.
//!
//! The compiler consumes borrowed [`ImageView`]s: an f32 sample buffer
//! plus dimensions and element strides. [`ImageBuf`] is the owning
//! variant the tests and the schedule simulator allocate.

use crate::error::CompileError;

/// A borrowed, strided, multi-channel f32 image.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    data: &'a [f32],
    /// Pixels per scanline.
    pub width: usize,
    /// Scanlines per frame.
    pub height: usize,
    /// Frames in the sequence.
    pub frames: usize,
    /// Samples per pixel.
    pub channels: usize,
    /// Elements between horizontally adjacent pixels.
    pub xstride: usize,
    /// Elements between vertically adjacent pixels.
    pub ystride: usize,
    /// Elements between temporally adjacent pixels.
    pub tstride: usize,
    /// Elements between adjacent channels of one pixel.
    pub cstride: usize,
}

impl<'a> ImageView<'a> {
    /// Wrap a buffer with explicit strides.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data: &'a [f32],
        (width, height, frames, channels): (usize, usize, usize, usize),
        (xstride, ystride, tstride, cstride): (usize, usize, usize, usize),
    ) -> Result<Self, CompileError> {
        if width == 0 || height == 0 || frames == 0 || channels == 0 {
            return Err(CompileError::Shape("empty image".to_string()));
        }
        let last = (width - 1) * xstride
            + (height - 1) * ystride
            + (frames - 1) * tstride
            + (channels - 1) * cstride;
        if last >= data.len() {
            return Err(CompileError::Shape(format!(
                "buffer holds {} elements but the strides address {}",
                data.len(),
                last + 1
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            frames,
            channels,
            xstride,
            ystride,
            tstride,
            cstride,
        })
    }

    /// The raw sample buffer.
    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    /// Element index of `(x, y, t, c)`.
    pub fn index(&self, x: usize, y: usize, t: usize, c: usize) -> usize {
        x * self.xstride + y * self.ystride + t * self.tstride + c * self.cstride
    }

    /// Sample at integer coordinates.
    pub fn at(&self, x: usize, y: usize, t: usize, c: usize) -> f32 {
        self.data[self.index(x, y, t, c)]
    }

    /// Sample at integer coordinates, zero outside the image.
    fn at_or_zero(&self, x: i64, y: i64, t: usize, c: usize) -> f32 {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            0.0
        } else {
            self.at(x as usize, y as usize, t, c)
        }
    }

    /// 2-D Lanczos-3 resample of every channel at `(fx, fy)` in frame
    /// `t`. Out-of-image taps contribute zero; the tap weights are
    /// normalised to unit sum, so integer coordinates reproduce the
    /// stored sample exactly.
    pub fn sample2d(&self, fx: f32, fy: f32, t: usize, result: &mut [f32]) {
        let ix = fx.floor() as i64;
        let iy = fy.floor() as i64;

        let mut wx = [0.0f32; 6];
        let mut wy = [0.0f32; 6];
        let mut total_x = 0.0;
        let mut total_y = 0.0;
        for (i, w) in wx.iter_mut().enumerate() {
            *w = lanczos3(fx - (ix - 2 + i as i64) as f32);
            total_x += *w;
        }
        for (i, w) in wy.iter_mut().enumerate() {
            *w = lanczos3(fy - (iy - 2 + i as i64) as f32);
            total_y += *w;
        }
        for w in wx.iter_mut() {
            *w /= total_x;
        }
        for w in wy.iter_mut() {
            *w /= total_y;
        }

        result[..self.channels].fill(0.0);
        for (j, wyj) in wy.iter().enumerate() {
            for (i, wxi) in wx.iter().enumerate() {
                let weight = wyj * wxi;
                for (c, out) in result[..self.channels].iter_mut().enumerate() {
                    *out += weight * self.at_or_zero(ix - 2 + i as i64, iy - 2 + j as i64, t, c);
                }
            }
        }
    }

    /// 3-D Lanczos-3 resample at `(fx, fy)` across frames around `ft`.
    pub fn sample3d(&self, fx: f32, fy: f32, ft: f32, result: &mut [f32]) {
        let it = ft.floor() as i64;
        let mut wt = [0.0f32; 6];
        let mut total = 0.0;
        for (i, w) in wt.iter_mut().enumerate() {
            *w = lanczos3(ft - (it - 2 + i as i64) as f32);
            total += *w;
        }
        for w in wt.iter_mut() {
            *w /= total;
        }

        result[..self.channels].fill(0.0);
        let mut plane = vec![0.0f32; self.channels];
        for (i, wti) in wt.iter().enumerate() {
            let t = it - 2 + i as i64;
            if t < 0 || t >= self.frames as i64 {
                continue;
            }
            self.sample2d(fx, fy, t as usize, &mut plane);
            for (out, p) in result[..self.channels].iter_mut().zip(&plane) {
                *out += wti * p;
            }
        }
    }
}

/// The Lanczos-3 kernel: `sinc(x)·sinc(x/3)` inside `|x| < 3`, zero
/// outside, one at the origin.
pub fn lanczos3(x: f32) -> f32 {
    let ax = x.abs();
    if ax < 1e-6 {
        1.0
    } else if ax >= 3.0 {
        0.0
    } else {
        let pix = std::f32::consts::PI * x;
        3.0 * pix.sin() * (pix / 3.0).sin() / (pix * pix)
    }
}

/// An owning, densely interleaved image.
#[derive(Debug, Clone)]
pub struct ImageBuf {
    data: Vec<f32>,
    width: usize,
    height: usize,
    frames: usize,
    channels: usize,
}

impl ImageBuf {
    /// A zero-filled image of the given dimensions, laid out with
    /// channels innermost.
    pub fn new(width: usize, height: usize, frames: usize, channels: usize) -> Self {
        Self {
            data: vec![0.0; width * height * frames * channels],
            width,
            height,
            frames,
            channels,
        }
    }

    /// Fill every sample from `f(x, y, t, c)`.
    pub fn fill_with(&mut self, f: impl Fn(usize, usize, usize, usize) -> f32) {
        for t in 0..self.frames {
            for y in 0..self.height {
                for x in 0..self.width {
                    for c in 0..self.channels {
                        let idx = self.index(x, y, t, c);
                        self.data[idx] = f(x, y, t, c);
                    }
                }
            }
        }
    }

    fn index(&self, x: usize, y: usize, t: usize, c: usize) -> usize {
        ((t * self.height + y) * self.width + x) * self.channels + c
    }

    /// Sample at integer coordinates.
    pub fn at(&self, x: usize, y: usize, t: usize, c: usize) -> f32 {
        self.data[self.index(x, y, t, c)]
    }

    /// Overwrite one sample.
    pub fn set(&mut self, x: usize, y: usize, t: usize, c: usize, v: f32) {
        let idx = self.index(x, y, t, c);
        self.data[idx] = v;
    }

    /// A borrowed view with the interleaved strides spelled out.
    pub fn view(&self) -> ImageView<'_> {
        ImageView {
            data: &self.data,
            width: self.width,
            height: self.height,
            frames: self.frames,
            channels: self.channels,
            xstride: self.channels,
            ystride: self.width * self.channels,
            tstride: self.width * self.height * self.channels,
            cstride: 1,
        }
    }
}

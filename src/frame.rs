/// One decoded video frame; pixel layout is owned by the media backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub dims: (u32, u32),
    pub data: Vec<u8>,
    pub index: u64,
    pub timestamp: f64, // in seconds
}

impl Frame {
    #[inline]
    pub fn new(dims: (u32, u32), data: Vec<u8>, index: u64, timestamp: f64) -> Self {
        Self {
            dims,
            data,
            index,
            timestamp,
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.dims.0
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.dims.1
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

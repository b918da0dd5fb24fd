use slotmap::new_key_type;

new_key_type! {
    /// 设备上的 buffer，只是一个代际索引，真正的所有权在创建它的资源对象上
    pub struct GfxBufferHandle;

    /// 设备上的加速结构
    pub struct GfxAccelerationHandle;
}
